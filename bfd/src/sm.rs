// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-session BFD state machine per RFC 5880 section 6.8.6.
//!
//! ```text
//!                             +--+
//!                             |  | UP, ADMIN DOWN, TIMER
//!                             |  V
//!                     DOWN  +------+  INIT
//!              +------------|      |------------+
//!              |            | DOWN |            |
//!              |  +-------->|      |<--------+  |
//!              |  |         +------+         |  |
//!              |  |                          |  |
//!              |  |               ADMIN DOWN,|  |
//!              |  |ADMIN DOWN,          DOWN,|  |
//!              |  |TIMER                TIMER|  |
//!              V  |                          |  V
//!            +------+                      +------+
//!       +----|      |                      |      |----+
//!   DOWN|    | INIT |--------------------->|  UP  |    |INIT, UP
//!       +--->|      | INIT, UP             |      |<---+
//!            +------+                      +------+
//! ```
//!
//! Transitions run inside the dispatcher so entry actions can arm and cancel
//! the session timers and push records to the event sink.

use crate::dispatcher::Dispatcher;
use crate::packet::Control;
use crate::sched::Dispatch;
use crate::{clock, to_canonical, Diag, SessionState};
use slog::{debug, info, warn};
use std::net::SocketAddr;

impl Dispatcher {
    /// Validate and demultiplex one inbound packet, then run it through the
    /// session state machine. Anything that fails a check is silently
    /// dropped, leaving session state untouched.
    pub fn handle_packet(
        &mut self,
        data: &[u8],
        src: SocketAddr,
        ttl: Option<u8>,
    ) {
        match Control::from_bytes(data) {
            Ok(pkt) => self.handle_control(pkt, data.len(), src, ttl),
            Err(e) => {
                debug!(self.log, "discarding bogus packet from {src}: {e}")
            }
        }
    }

    pub(crate) fn handle_control(
        &mut self,
        pkt: Control,
        wire_len: usize,
        src: SocketAddr,
        ttl: Option<u8>,
    ) {
        if let Err(e) = pkt.check(wire_len, ttl) {
            debug!(self.log, "discarding bogus packet from {src}: {e}");
            return;
        }

        let idx = if pkt.your_discriminator != 0 {
            self.store.find_by_discr(pkt.your_discriminator)
        } else {
            self.store.find_by_neighbor(to_canonical(src.ip()))
        };
        let Some(idx) = idx else {
            debug!(self.log,
                "discarding packet from {src} (session not found, your \
                 discriminator field is {})",
                pkt.your_discriminator);
            return;
        };

        if self.store.session(idx).is_admin_down() {
            debug!(self.log,
                "discarding packet from {src} (session is in AdminDown \
                 state)");
            return;
        }

        self.apply(idx, &pkt);
    }

    /// RFC 5880 section 6.8.6 reception processing for a validated packet
    /// that demultiplexed to the session at `idx`.
    pub(crate) fn apply(&mut self, idx: usize, pkt: &Control) {
        let now = clock::timer_now();

        let tx_reduced;
        let timers_changed;
        let detect_changed;
        let old_detect_time;
        {
            let s = self.store.session_mut(idx);
            let (Ok(remote_state), Ok(remote_diag)) =
                (pkt.state(), pkt.diag())
            else {
                // unreachable past check(); drop rather than panic
                return;
            };
            s.remote_discr = pkt.my_discriminator;
            s.remote_state = remote_state;
            s.remote_diag = remote_diag;
            s.remote_min_rx_intv = pkt.required_min_rx as u64;
            s.remote_min_tx_intv = pkt.desired_min_tx as u64;
            s.remote_demand = pkt.demand();
            s.remote_detect_mult = pkt.detect_mult;

            // A final bit terminates our poll sequence.
            if pkt.r#final() {
                s.poll = false;
            }

            let old_local_tx = s.local_tx_intv;
            let old_remote_tx = s.remote_tx_intv;
            let old_local_detect = s.local_detect_time;
            let old_remote_detect = s.remote_detect_time;

            // Transmit intervals renegotiate while the session is coming up
            // and at the ends of a poll sequence. While Up without poll or
            // final they stay frozen.
            if !s.is_up() || pkt.r#final() || pkt.poll() {
                s.update_local_tx_intv();
                s.update_remote_tx_intv();
            }
            s.local_detect_time =
                s.remote_detect_mult as u64 * s.remote_tx_intv;
            s.remote_detect_time =
                s.local_detect_mult as u64 * s.local_tx_intv;

            tx_reduced = s.local_tx_intv < old_local_tx;
            detect_changed = s.local_detect_time != old_local_detect;
            timers_changed = s.local_tx_intv != old_local_tx
                || s.remote_tx_intv != old_remote_tx
                || s.local_detect_time != old_local_detect
                || s.remote_detect_time != old_remote_detect;
            old_detect_time = old_local_detect;
        }

        if timers_changed {
            self.dump_timers(idx);
        }

        // A shrinking transmit interval takes effect immediately.
        if tx_reduced && self.store.session(idx).timer_tx.is_some() {
            self.sender_cancel(idx);
            self.sender_schedule(idx);
        }

        if detect_changed {
            let s = self.store.session(idx);
            info!(self.log,
                "detection time is {} ms (was {} ms)",
                s.local_detect_time / 1000, old_detect_time / 1000;
                "instance" => &s.name);
        }

        let (local, remote) = {
            let s = self.store.session(idx);
            (s.local_state, s.remote_state)
        };
        use SessionState::*;
        if remote == AdminDown && local != Down {
            self.state_down(idx, Diag::NbrSignalledDown);
        } else {
            match local {
                Down => match remote {
                    Down => self.state_init(idx),
                    Init => self.state_up(idx),
                    _ => {}
                },
                Init => {
                    if matches!(remote, Init | Up) {
                        self.state_up(idx);
                    }
                }
                Up => {
                    if remote == Down {
                        self.state_down(idx, Diag::NbrSignalledDown);
                    }
                }
                AdminDown => {}
            }
        }

        // Demand mode: with both sides up and the remote asking, periodic
        // transmission stops; in every other combination it runs.
        let (demand_quiet, scheduled) = {
            let s = self.store.session(idx);
            (
                s.remote_demand && s.is_up() && s.remote_state == Up,
                s.timer_tx.is_some(),
            )
        };
        if demand_quiet && scheduled {
            self.sender_cancel(idx);
        }
        if !demand_quiet && self.store.session(idx).timer_tx.is_none() {
            self.sender_schedule(idx);
        }

        // Answer a poll right away, outside the periodic cadence.
        if pkt.poll() {
            let name = {
                let s = self.store.session_mut(idx);
                s.r#final = true;
                s.name.clone()
            };
            self.sched.add_event(Dispatch::TransmitOnce(name));
        }

        self.store.session_mut(idx).last_seen = Some(now);
        if self.store.session(idx).timer_exp.is_some() {
            self.expire_cancel(idx);
            self.expire_schedule(idx);
        }
    }

    /// Common actions for entering Init and Up.
    fn rise(&mut self, idx: usize) {
        {
            let s = self.store.session_mut(idx);
            // RFC 5880 doesn't state whether the diagnostic must clear here
            s.local_diag = Diag::NoDiag;
            info!(self.log, "entering {} state", s.local_state;
                "instance" => &s.name);
        }
        self.reset_cancel(idx);
        if self.store.session(idx).timer_exp.is_none() {
            self.expire_schedule(idx);
        }
        self.sink.send(self.store.session(idx));
    }

    /// Common actions for entering Down and AdminDown. RFC 5880 section
    /// 6.8.3: while the session is not up the transmit interval must be at
    /// least one second.
    fn fall(&mut self, idx: usize) {
        self.store.session_mut(idx).idle_local_tx_intv();
        self.expire_cancel(idx);
        self.sink.send(self.store.session(idx));
    }

    pub(crate) fn state_up(&mut self, idx: usize) {
        self.store.session_mut(idx).local_state = SessionState::Up;
        self.rise(idx);
    }

    pub(crate) fn state_init(&mut self, idx: usize) {
        // a session cannot transition directly from Init to Up
        debug_assert!(!self.store.session(idx).is_up());
        self.store.session_mut(idx).local_state = SessionState::Init;
        self.rise(idx);
    }

    pub(crate) fn state_down(&mut self, idx: usize, diag: Diag) {
        {
            let s = self.store.session_mut(idx);
            s.local_state = SessionState::Down;
            s.local_diag = diag;
            warn!(self.log, "entering Down state";
                "instance" => &s.name,
                "local_diag" => %s.local_diag,
                "remote_diag" => %s.remote_diag);
        }
        self.reset_schedule(idx);
        self.fall(idx);
    }

    pub(crate) fn state_admin_down(&mut self, idx: usize) {
        {
            let s = self.store.session_mut(idx);
            s.local_state = SessionState::AdminDown;
            s.local_diag = Diag::AdminDown;
            warn!(self.log, "entering AdminDown state";
                "instance" => &s.name);
        }
        self.sender_cancel(idx);
        self.reset_cancel(idx);
        self.fall(idx);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{Event, EventSink, EVENT_LEN};
    use crate::session::Session;
    use crate::store::SessionStore;
    use crate::{test_logger, udp};
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn events(&self) -> Vec<Event> {
            let bytes = self.0.lock().unwrap();
            bytes
                .chunks_exact(EVENT_LEN)
                .map(|c| Event::from_bytes(c).unwrap())
                .collect()
        }
    }

    /// A dispatcher with one session pointed at `neighbor`, with a real
    /// output socket so transmissions succeed.
    fn dispatcher(name: &str, neighbor: &str) -> (Dispatcher, Capture) {
        let cap = Capture::default();
        let mut store = SessionStore::new();
        let mut s = Session::new(name);
        let neighbor: IpAddr = neighbor.parse().unwrap();
        s.neighbor = Some(neighbor);
        s.local_min_rx_intv = 50_000;
        s.local_min_tx_intv = 50_000;
        s.local_detect_mult = 3;
        s.local_discr = store.alloc_discr();
        s.sock_out = Some(udp::open_transmit(neighbor, None).unwrap());
        store.push(s);
        let sink = EventSink::new(Some(Box::new(cap.clone())), test_logger());
        (Dispatcher::new(store, sink, test_logger()), cap)
    }

    fn src(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 49152)
    }

    /// Deliver each side's current packet to the other.
    fn exchange(a: &mut Dispatcher, a_ip: &str, b: &mut Dispatcher, b_ip: &str) {
        let from_a = a.store.session(0).control_packet().to_bytes();
        let from_b = b.store.session(0).control_packet().to_bytes();
        b.handle_packet(&from_a, src(a_ip), Some(255));
        a.handle_packet(&from_b, src(b_ip), Some(255));
    }

    const A_IP: &str = "127.0.0.1";
    const B_IP: &str = "127.0.0.2";

    fn up_pair() -> (Dispatcher, Capture, Dispatcher, Capture) {
        let (mut a, cap_a) = dispatcher("a", B_IP);
        let (mut b, cap_b) = dispatcher("b", A_IP);
        for _ in 0..3 {
            exchange(&mut a, A_IP, &mut b, B_IP);
        }
        assert!(a.store.session(0).is_up());
        assert!(b.store.session(0).is_up());
        (a, cap_a, b, cap_b)
    }

    #[test]
    fn test_cold_bring_up_to_up() {
        let (mut a, cap_a, mut b, _cap_b) = up_pair();

        // negotiated interval: max(min_tx, remote min_rx) on both sides
        assert_eq!(a.store.session(0).local_tx_intv, 50_000);
        assert_eq!(b.store.session(0).local_tx_intv, 50_000);
        assert_eq!(a.store.session(0).local_detect_time, 150_000);

        // discriminators learned in both directions
        assert_eq!(
            a.store.session(0).remote_discr,
            b.store.session(0).local_discr
        );
        assert_eq!(
            b.store.session(0).remote_discr,
            a.store.session(0).local_discr
        );

        // one event per rise: down -> init -> up
        let events = cap_a.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].state, SessionState::Init);
        assert_eq!(events[1].state, SessionState::Up);

        // expire armed, reset not armed, sender armed
        let s = a.store.session(0);
        assert!(s.timer_exp.is_some());
        assert!(s.timer_rst.is_none());
        assert!(s.timer_tx.is_some());

        // another Up packet while Up leaves state and intervals alone
        let from_b = b.store.session(0).control_packet().to_bytes();
        a.handle_packet(&from_b, src(B_IP), Some(255));
        assert!(a.store.session(0).is_up());
        assert_eq!(cap_a.events().len(), 2);
    }

    #[test]
    fn test_direct_down_to_up_is_impossible() {
        let (mut a, _cap_a) = dispatcher("a", B_IP);
        let (b, _cap_b) = dispatcher("b", A_IP);

        // remote claims Up while we are Down: no transition
        let mut pkt = b.store.session(0).control_packet();
        pkt.set_state(SessionState::Up);
        pkt.your_discriminator = a.store.session(0).local_discr;
        a.handle_packet(&pkt.to_bytes(), src(B_IP), Some(255));
        assert!(a.store.session(0).is_down());
    }

    #[test]
    fn test_expiration() {
        let (mut a, cap_a, _b, _cap_b) = up_pair();
        assert_eq!(a.store.session(0).local_detect_time, 150_000);

        a.dispatch(Dispatch::Expire("a".to_string()));

        let s = a.store.session(0);
        assert!(s.is_down());
        assert_eq!(s.local_diag, Diag::Expired);
        assert_eq!(s.remote_discr, 0);
        assert_eq!(s.local_tx_intv, s.local_idle_tx_intv);
        assert!(s.timer_rst.is_some());
        assert!(s.timer_exp.is_none());

        let events = cap_a.events();
        assert_eq!(events.last().unwrap().state, SessionState::Down);
    }

    #[test]
    fn test_reset_after_down() {
        let (mut a, _cap_a, _b, _cap_b) = up_pair();
        let old_discr = a.store.session(0).local_discr;
        a.dispatch(Dispatch::Expire("a".to_string()));
        a.dispatch(Dispatch::Reset("a".to_string()));

        let s = a.store.session(0);
        assert!(s.is_down());
        assert_eq!(s.remote_state, SessionState::Down);
        assert_eq!(s.local_diag, Diag::NoDiag);
        assert_ne!(s.local_discr, 0);
        assert_ne!(s.local_discr, old_discr);
        assert_eq!(s.last_seen, None);
        assert!(s.timer_rst.is_none());
    }

    #[test]
    fn test_remote_admin_down() {
        let (mut a, cap_a, b, _cap_b) = up_pair();

        let mut pkt = b.store.session(0).control_packet();
        pkt.set_state(SessionState::AdminDown);
        a.handle_packet(&pkt.to_bytes(), src(B_IP), Some(255));

        let s = a.store.session(0);
        assert!(s.is_down());
        assert_eq!(s.local_diag, Diag::NbrSignalledDown);
        assert_eq!(cap_a.events().last().unwrap().state, SessionState::Down);
    }

    #[test]
    fn test_poll_final_renegotiation() {
        let (mut a, _cap_a, mut b, _cap_b) = up_pair();

        // interval change on a: 50ms -> 20ms, against b's 10ms min_rx
        b.store.session_mut(0).local_min_rx_intv = 10_000;
        a.store.session_mut(0).local_min_tx_intv = 20_000;
        let log = a.log.clone();
        a.store.session_mut(0).start_poll(&log);
        assert!(a.store.session(0).poll);

        // b answers the poll with final and owes an immediate transmit
        let from_a = a.store.session(0).control_packet().to_bytes();
        b.handle_packet(&from_a, src(A_IP), Some(255));
        assert!(b.store.session(0).r#final);
        assert_eq!(
            b.sched.pop_due(0),
            Some(Dispatch::TransmitOnce("b".to_string()))
        );

        let reply = b.store.session(0).control_packet();
        assert!(reply.r#final());
        assert!(!reply.poll());

        // the final clears a's poll and unfreezes the intervals
        let old_tx_timer = a.store.session(0).timer_tx;
        a.handle_packet(&reply.to_bytes(), src(B_IP), Some(255));
        let s = a.store.session(0);
        assert!(!s.poll);
        assert_eq!(s.local_tx_intv, 20_000);
        // the reduced interval rescheduled the sender
        assert_ne!(s.timer_tx, old_tx_timer);

        // b's sender clears the final flag when the response goes out
        b.dispatch(Dispatch::TransmitOnce("b".to_string()));
        assert!(!b.store.session(0).r#final);
    }

    #[test]
    fn test_intervals_frozen_while_up() {
        let (mut a, _cap_a, mut b, _cap_b) = up_pair();

        // without a poll sequence, a changed advertisement does not move
        // the negotiated intervals while the session is up
        b.store.session_mut(0).local_min_rx_intv = 200_000;
        let from_b = b.store.session(0).control_packet().to_bytes();
        a.handle_packet(&from_b, src(B_IP), Some(255));
        assert_eq!(a.store.session(0).local_tx_intv, 50_000);

        // with the poll bit set they renegotiate immediately
        b.store.session_mut(0).start_poll(&b.log.clone());
        let from_b = b.store.session(0).control_packet().to_bytes();
        a.handle_packet(&from_b, src(B_IP), Some(255));
        assert_eq!(a.store.session(0).local_tx_intv, 200_000);
    }

    #[test]
    fn test_remote_demand_suppresses_sender() {
        let (mut a, _cap_a, b, _cap_b) = up_pair();
        assert!(a.store.session(0).timer_tx.is_some());

        let mut pkt = b.store.session(0).control_packet();
        pkt.set_demand();
        a.handle_packet(&pkt.to_bytes(), src(B_IP), Some(255));
        assert!(a.store.session(0).timer_tx.is_none());

        // demand withdrawn: periodic transmission resumes
        let pkt = b.store.session(0).control_packet();
        a.handle_packet(&pkt.to_bytes(), src(B_IP), Some(255));
        assert!(a.store.session(0).timer_tx.is_some());
    }

    #[test]
    fn test_admin_down_discards_inbound() {
        let (mut a, cap_a, b, _cap_b) = up_pair();
        a.state_admin_down(0);
        {
            let s = a.store.session(0);
            assert!(s.timer_tx.is_none());
            assert!(s.timer_exp.is_none());
            assert!(s.timer_rst.is_none());
            assert_eq!(s.local_diag, Diag::AdminDown);
        }
        let n_events = cap_a.events().len();

        let from_b = b.store.session(0).control_packet().to_bytes();
        a.handle_packet(&from_b, src(B_IP), Some(255));
        let s = a.store.session(0);
        assert!(s.is_admin_down());
        assert_eq!(cap_a.events().len(), n_events);
    }

    #[test]
    fn test_send_failure_goes_admin_down() {
        // v4 socket with a v6 neighbor: sendto must fail
        let (mut a, cap_a) = dispatcher("a", B_IP);
        a.store.session_mut(0).neighbor = Some("::1".parse().unwrap());
        a.sender_schedule(0);
        a.dispatch(Dispatch::Transmit("a".to_string()));

        let s = a.store.session(0);
        assert!(s.is_admin_down());
        assert!(s.timer_tx.is_none());
        assert_eq!(
            cap_a.events().last().unwrap().state,
            SessionState::AdminDown
        );
    }

    #[test]
    fn test_demux_by_discriminator_and_address() {
        let (mut a, _cap_a, b, _cap_b) = up_pair();

        // nonzero your-discriminator that matches no session: dropped
        let mut pkt = b.store.session(0).control_packet();
        pkt.your_discriminator = 0xffff_ffff;
        let before = a.store.session(0).last_seen;
        a.handle_packet(&pkt.to_bytes(), src(B_IP), Some(255));
        assert_eq!(a.store.session(0).last_seen, before);

        // zero your-discriminator demuxes by source address, so a Down
        // packet from an unknown address is dropped
        let mut pkt = b.store.session(0).control_packet();
        pkt.set_state(SessionState::Down);
        pkt.your_discriminator = 0;
        a.handle_packet(&pkt.to_bytes(), src("127.0.0.9"), Some(255));
        assert!(a.store.session(0).is_up());
    }

    #[test]
    fn test_ttl_gate() {
        let (mut a, _cap_a) = dispatcher("a", B_IP);
        let (b, _cap_b) = dispatcher("b", A_IP);

        let from_b = b.store.session(0).control_packet().to_bytes();
        a.handle_packet(&from_b, src(B_IP), Some(254));
        assert!(a.store.session(0).is_down());
        assert_eq!(a.store.session(0).remote_discr, 0);

        a.handle_packet(&from_b, src(B_IP), Some(255));
        assert!(a.store.session(0).is_init());
    }

    #[test]
    fn test_reload_preserves_state_and_timers() {
        let (a, cap_a, _b, _cap_b) = up_pair();
        // bind the listener on an ephemeral port so release has something
        // to keep open across the reload
        let mut a = a.with_port(0);
        a.init().unwrap();
        let discr = a.store.session(0).local_discr;
        let n_events = cap_a.events().len();

        a.release(true);
        {
            let s = a.store.session(0);
            assert!(s.timer_tx.is_none());
            assert!(s.timer_exp.is_none());
            assert!(s.sands_tx.is_some());
            assert!(s.sands_exp.is_some());
            assert!(s.sock_out.is_none());
        }

        // the incoming store is what a config re-parse would produce
        let mut fresh = SessionStore::new();
        let mut s = Session::new("a");
        s.neighbor = Some(B_IP.parse().unwrap());
        s.local_min_rx_intv = 50_000;
        s.local_min_tx_intv = 50_000;
        s.local_detect_mult = 3;
        s.local_discr = fresh.alloc_discr();
        fresh.push(s);
        fresh.absorb(&a.store);
        a.store = fresh;
        a.init().unwrap();

        let s = a.store.session(0);
        assert!(s.is_up());
        assert_eq!(s.local_discr, discr);
        assert!(s.timer_tx.is_some());
        assert!(s.timer_exp.is_some());
        assert!(s.sands_tx.is_none());
        assert!(s.sands_exp.is_none());
        assert!(s.sock_out.is_some());
        // no down/init events were emitted by the reload
        assert_eq!(cap_a.events().len(), n_events);
    }

    #[test]
    fn test_release_before_init_is_noop() {
        let (mut a, _cap_a) = dispatcher("a", B_IP);
        a.release(true);
        assert!(a.store.session(0).sands_tx.is_none());
        assert!(a.store.session(0).sock_out.is_some());
    }
}
