// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-threaded timer scheduling for the dispatcher. Timers carry absolute
//! microsecond deadlines on the monotonic clock and fire in deadline order.
//! Immediate events are dispatched ahead of any timer due in the same tick.
//! Cancellation is synchronous: once `cancel` returns, the entry will not be
//! popped.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};

/// Work items the dispatcher reacts to, keyed by session name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Periodic control packet transmission.
    Transmit(String),

    /// One-shot transmission outside the periodic cadence, used to answer a
    /// poll with the final bit. Does not reschedule.
    TransmitOnce(String),

    /// Detection time elapsed without a packet from the neighbor.
    Expire(String),

    /// Post-down delay elapsed; the session resets to its initial state.
    Reset(String),
}

/// Handle for a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    deadline: u64,
    seq: u64,
    dispatch: Dispatch,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Deadlines of live timers. Absence means cancelled or already fired;
    /// such heap entries are skipped when encountered.
    live: HashMap<u64, u64>,
    events: VecDeque<Dispatch>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer to fire `delay` microseconds after `now`.
    pub fn add_timer(
        &mut self,
        now: u64,
        delay: u64,
        dispatch: Dispatch,
    ) -> TimerKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = now + delay;
        self.live.insert(seq, deadline);
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            dispatch,
        }));
        TimerKey(seq)
    }

    /// Enqueue an immediate event for the current tick.
    pub fn add_event(&mut self, dispatch: Dispatch) {
        self.events.push_back(dispatch);
    }

    /// Cancel a timer. After this returns the timer will not fire.
    pub fn cancel(&mut self, key: TimerKey) {
        self.live.remove(&key.0);
    }

    /// Time remaining until a live timer fires, negative if the deadline has
    /// already passed.
    pub fn remaining(&self, key: TimerKey, now: u64) -> Option<i64> {
        self.live.get(&key.0).map(|d| *d as i64 - now as i64)
    }

    /// Microseconds until the next dispatch is due, zero when an immediate
    /// event or an overdue timer is pending, `None` when nothing is queued.
    pub fn timeout_until_due(&mut self, now: u64) -> Option<u64> {
        if !self.events.is_empty() {
            return Some(0);
        }
        self.prune();
        self.heap
            .peek()
            .map(|Reverse(e)| e.deadline.saturating_sub(now))
    }

    /// Pop the next due dispatch: immediate events first, then timers whose
    /// deadline has passed, in deadline order.
    pub fn pop_due(&mut self, now: u64) -> Option<Dispatch> {
        if let Some(d) = self.events.pop_front() {
            return Some(d);
        }
        self.prune();
        if let Some(Reverse(e)) = self.heap.peek() {
            if e.deadline <= now {
                let Reverse(e) = self.heap.pop().unwrap();
                self.live.remove(&e.seq);
                return Some(e.dispatch);
            }
        }
        None
    }

    /// Drop cancelled entries from the top of the heap.
    fn prune(&mut self) {
        while let Some(Reverse(e)) = self.heap.peek() {
            if self.live.contains_key(&e.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tx(name: &str) -> Dispatch {
        Dispatch::Transmit(name.to_string())
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut sched = Scheduler::new();
        sched.add_timer(1000, 500, tx("b"));
        sched.add_timer(1000, 100, tx("a"));
        sched.add_timer(1000, 900, tx("c"));

        assert_eq!(sched.pop_due(1000), None);
        assert_eq!(sched.timeout_until_due(1000), Some(100));
        assert_eq!(sched.pop_due(1100), Some(tx("a")));
        assert_eq!(sched.pop_due(1100), None);
        assert_eq!(sched.pop_due(2000), Some(tx("b")));
        assert_eq!(sched.pop_due(2000), Some(tx("c")));
        assert_eq!(sched.pop_due(2000), None);
        assert_eq!(sched.timeout_until_due(2000), None);
    }

    #[test]
    fn test_events_run_before_due_timers() {
        let mut sched = Scheduler::new();
        sched.add_timer(0, 10, tx("timer"));
        sched.add_event(Dispatch::TransmitOnce("event".to_string()));

        assert_eq!(sched.timeout_until_due(0), Some(0));
        assert_eq!(
            sched.pop_due(100),
            Some(Dispatch::TransmitOnce("event".to_string()))
        );
        assert_eq!(sched.pop_due(100), Some(tx("timer")));
    }

    #[test]
    fn test_cancel_is_synchronous() {
        let mut sched = Scheduler::new();
        let key = sched.add_timer(0, 10, tx("gone"));
        sched.add_timer(0, 20, tx("kept"));
        sched.cancel(key);
        assert_eq!(sched.remaining(key, 0), None);
        assert_eq!(sched.pop_due(1000), Some(tx("kept")));
        assert_eq!(sched.pop_due(1000), None);
    }

    #[test]
    fn test_remaining_and_resume() {
        let mut sched = Scheduler::new();
        let key = sched.add_timer(1000, 500, tx("s"));
        assert_eq!(sched.remaining(key, 1200), Some(300));
        // a deadline in the past reports negative remaining time
        assert_eq!(sched.remaining(key, 2000), Some(-500));

        // suspend: capture remaining, cancel, re-register later
        let sands = sched.remaining(key, 1200).unwrap();
        sched.cancel(key);
        let key = sched.add_timer(5000, sands.max(0) as u64, tx("s"));
        assert_eq!(sched.remaining(key, 5000), Some(300));
        assert_eq!(sched.pop_due(5300), Some(tx("s")));
        assert_eq!(sched.remaining(key, 5300), None);
    }

    #[test]
    fn test_overdue_resume_fires_next_tick() {
        let mut sched = Scheduler::new();
        sched.add_timer(100, 0, tx("overdue"));
        assert_eq!(sched.timeout_until_due(100), Some(0));
        assert_eq!(sched.pop_due(100), Some(tx("overdue")));
    }
}
