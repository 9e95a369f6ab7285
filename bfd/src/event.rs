// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Out-of-band notification of session state changes to a downstream
//! consumer. Each state entry pushes one fixed-size record onto a byte
//! oriented unidirectional channel, typically a pipe to a failover
//! supervisor. Delivery is best effort: the session state is authoritative
//! and a failed write only logs at debug.

use crate::clock;
use crate::error::Error;
use crate::session::Session;
use crate::SessionState;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{debug, Logger};
use std::io::Write;

/// Fixed size of the NUL-padded instance name in a record.
pub const EVENT_NAME_LEN: usize = 32;

/// Total size of a wire record: name, one state byte, and a little-endian
/// u64 monotonic microsecond timestamp.
pub const EVENT_LEN: usize = EVENT_NAME_LEN + 1 + 8;

/// A session state change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    pub name: String,
    pub state: SessionState,
    pub sent_time: u64,
}

impl Event {
    pub fn to_bytes(&self) -> [u8; EVENT_LEN] {
        let mut buf = [0u8; EVENT_LEN];
        let name = self.name.as_bytes();
        let n = name.len().min(EVENT_NAME_LEN - 1);
        buf[..n].copy_from_slice(&name[..n]);
        buf[EVENT_NAME_LEN] = self.state as u8;
        buf[EVENT_NAME_LEN + 1..].copy_from_slice(&self.sent_time.to_le_bytes());
        buf
    }

    pub fn from_bytes(d: &[u8]) -> Result<Self, Error> {
        if d.len() < EVENT_LEN {
            return Err(Error::TooSmall(d.len()));
        }
        let name_end = d[..EVENT_NAME_LEN]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(EVENT_NAME_LEN);
        let name = String::from_utf8_lossy(&d[..name_end]).into_owned();
        let state = SessionState::try_from(d[EVENT_NAME_LEN])?;
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&d[EVENT_NAME_LEN + 1..EVENT_LEN]);
        Ok(Self {
            name,
            state,
            sent_time: u64::from_le_bytes(stamp),
        })
    }
}

/// Writer side of the event channel.
pub struct EventSink {
    out: Option<Box<dyn Write + Send>>,
    log: Logger,
}

impl EventSink {
    pub fn new(out: Option<Box<dyn Write + Send>>, log: Logger) -> Self {
        Self { out, log }
    }

    /// Push one record for the session's current state.
    pub fn send(&mut self, s: &Session) {
        let evt = Event {
            name: s.name.clone(),
            state: s.local_state,
            sent_time: clock::timer_now(),
        };
        let Some(out) = self.out.as_mut() else {
            return;
        };
        if let Err(e) =
            out.write_all(&evt.to_bytes()).and_then(|_| out.flush())
        {
            debug!(self.log, "event write failed: {e}";
                "instance" => &s.name);
        }
    }
}
