// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::session::Session;
use std::collections::HashSet;
use std::net::IpAddr;

/// The collection of configured sessions. Names and neighbor addresses are
/// unique by construction at configuration load; discriminators are unique by
/// construction at allocation. Session counts are small enough that linear
/// scans beat maintaining auxiliary maps across discriminator rerolls.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Vec<Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn push(&mut self, s: Session) {
        self.sessions.push(s);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut()
    }

    pub fn session(&self, idx: usize) -> &Session {
        &self.sessions[idx]
    }

    pub fn session_mut(&mut self, idx: usize) -> &mut Session {
        &mut self.sessions[idx]
    }

    pub fn get(&self, name: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.sessions.iter().position(|s| s.name == name)
    }

    /// Find the session a nonzero your-discriminator demultiplexes to.
    pub fn find_by_discr(&self, discr: u32) -> Option<usize> {
        self.sessions.iter().position(|s| s.local_discr == discr)
    }

    /// Find the session for a packet source address.
    pub fn find_by_neighbor(&self, addr: IpAddr) -> Option<usize> {
        self.sessions.iter().position(|s| s.neighbor == Some(addr))
    }

    /// Draw a random discriminator that is nonzero and unused by any session
    /// in the store. Collision probability is negligible at realistic session
    /// counts, so a retry loop suffices.
    pub fn alloc_discr(&self) -> u32 {
        loop {
            let discr: u32 = rand::random();
            if discr == 0 {
                continue;
            }
            if self.sessions.iter().any(|s| s.local_discr == discr) {
                continue;
            }
            return discr;
        }
    }

    /// Carry protocol state and suspended timer deadlines forward from a
    /// pre-reload store. Sessions match by name; disabled instances on either
    /// side start fresh. Afterwards discriminator uniqueness is restored by
    /// rerolling the sessions that did not inherit one.
    pub fn absorb(&mut self, old: &SessionStore) {
        let mut matched = vec![false; self.sessions.len()];
        for (i, s) in self.sessions.iter_mut().enumerate() {
            if s.disabled {
                continue;
            }
            if let Some(o) = old.get(&s.name) {
                if o.disabled {
                    continue;
                }
                s.copy_state(o);
                s.copy_sands(o);
                matched[i] = true;
            }
        }

        let mut seen: HashSet<u32> = self
            .sessions
            .iter()
            .zip(matched.iter())
            .filter(|(_, m)| **m)
            .map(|(s, _)| s.local_discr)
            .collect();
        for (i, s) in self.sessions.iter_mut().enumerate() {
            if matched[i] {
                continue;
            }
            while s.local_discr == 0 || seen.contains(&s.local_discr) {
                s.local_discr = rand::random();
            }
            seen.insert(s.local_discr);
        }
    }
}
