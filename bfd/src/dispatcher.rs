// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatcher owns the session store, the timer scheduler, the shared
//! listening socket and the event sink, and drives everything from a single
//! thread. A packet's arrival and its full state machine reaction run
//! atomically with respect to every other session; no callback yields
//! mid-execution.

use crate::clock;
use crate::error::Error;
use crate::event::EventSink;
use crate::packet::Control;
use crate::sched::{Dispatch, Scheduler};
use crate::store::SessionStore;
use crate::{udp, BFD_CONTROL_PORT};
use rand::Rng;
use slog::{debug, error, warn, Logger};
use std::net::SocketAddr;
use std::time::Duration;

/// Shared receive buffer. Sized generously past the 24 byte control packet
/// so the length-mismatch check sees oversized packets instead of kernel
/// truncation.
const BFD_BUFFER_SIZE: usize = 64;

/// Soft receive timeout. Purely liveness insurance for the loop, not a
/// protocol timeout.
const RECV_SOFT_TIMEOUT: u64 = 60_000_000;

pub struct Dispatcher {
    pub store: SessionStore,
    pub(crate) sched: Scheduler,
    pub(crate) sink: EventSink,
    sock_in: Option<socket2::Socket>,
    port: u16,
    buf: Vec<u8>,
    pub(crate) log: Logger,
}

impl Dispatcher {
    pub fn new(store: SessionStore, sink: EventSink, log: Logger) -> Self {
        Self {
            store,
            sched: Scheduler::new(),
            sink,
            sock_in: None,
            port: BFD_CONTROL_PORT,
            buf: vec![0; BFD_BUFFER_SIZE],
            log,
        }
    }

    /// Override the control port. Intended for tests; real deployments stay
    /// on 3784.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Start or resume the dispatcher: open the listening socket if this is
    /// the first start, open per-session output sockets, and arm or resume
    /// each session's timers. A listening socket failure is fatal to the
    /// caller; an output socket failure only takes its instance to AdminDown.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.sock_in.is_none() {
            match udp::open_listener(self.port) {
                Ok(sk) => self.sock_in = Some(sk),
                Err(e) => {
                    error!(self.log, "unable to open listening socket: {e}");
                    return Err(e);
                }
            }
        }

        for idx in 0..self.store.len() {
            if self.store.session(idx).disabled {
                continue;
            }
            if self.store.session(idx).sock_out.is_none() {
                let (neighbor, source) = {
                    let s = self.store.session(idx);
                    (s.neighbor, s.source)
                };
                let Some(neighbor) = neighbor else { continue };
                match udp::open_transmit(neighbor, source) {
                    Ok(sk) => {
                        self.store.session_mut(idx).sock_out = Some(sk)
                    }
                    Err(e) => {
                        error!(self.log,
                            "unable to open output socket, disabling \
                             instance: {e}";
                            "instance" => &self.store.session(idx).name);
                        self.state_admin_down(idx);
                        continue;
                    }
                }
            }
            self.register_timers(idx);
        }
        Ok(())
    }

    /// Arm or resume one session's timers after a start or reload. Suspended
    /// deadlines of an AdminDown session are discarded rather than resumed.
    fn register_timers(&mut self, idx: usize) {
        let now = clock::timer_now();
        let admin_down = self.store.session(idx).is_admin_down();

        if let Some(sands) = self.store.session_mut(idx).sands_tx.take() {
            if !admin_down {
                let sched = &mut self.sched;
                let s = self.store.session_mut(idx);
                let key = sched.add_timer(
                    now,
                    sands.max(0) as u64,
                    Dispatch::Transmit(s.name.clone()),
                );
                s.timer_tx = Some(key);
            }
        } else if !admin_down && self.store.session(idx).timer_tx.is_none() {
            self.sender_schedule(idx);
        }

        if let Some(sands) = self.store.session_mut(idx).sands_exp.take() {
            if !admin_down {
                let sched = &mut self.sched;
                let s = self.store.session_mut(idx);
                let key = sched.add_timer(
                    now,
                    sands.max(0) as u64,
                    Dispatch::Expire(s.name.clone()),
                );
                s.timer_exp = Some(key);
            }
        }

        if let Some(sands) = self.store.session_mut(idx).sands_rst.take() {
            if !admin_down {
                let sched = &mut self.sched;
                let s = self.store.session_mut(idx);
                let key = sched.add_timer(
                    now,
                    sands.max(0) as u64,
                    Dispatch::Reset(s.name.clone()),
                );
                s.timer_rst = Some(key);
            }
        }
    }

    /// Suspend the dispatcher: capture the remaining time of every armed
    /// timer into its sands slot, cancel it, and close the output sockets.
    /// The listening socket stays open across a reload.
    pub fn release(&mut self, reload: bool) {
        // Never initialized; nothing to tear down.
        if self.sock_in.is_none() {
            return;
        }
        if !reload {
            self.sock_in = None;
        }

        let now = clock::timer_now();
        let sched = &mut self.sched;
        for s in self.store.iter_mut() {
            if s.disabled {
                continue;
            }
            if let Some(key) = s.timer_tx.take() {
                s.sands_tx = sched.remaining(key, now);
                sched.cancel(key);
            }
            if let Some(key) = s.timer_exp.take() {
                s.sands_exp = sched.remaining(key, now);
                sched.cancel(key);
            }
            if let Some(key) = s.timer_rst.take() {
                s.sands_rst = sched.remaining(key, now);
                sched.cancel(key);
            }
            s.sock_out = None;
        }
    }

    /// Replace the configuration without flapping sessions: suspend, load
    /// the new store, carry state and saved deadlines forward by name, and
    /// resume.
    pub fn reload(&mut self, text: &str) -> Result<(), Error> {
        self.release(true);
        let mut fresh = crate::config::load(text, &self.log);
        fresh.absorb(&self.store);
        self.store = fresh;
        self.init()
    }

    /// Stop the dispatcher and close every socket.
    pub fn shutdown(&mut self) {
        self.release(false);
    }

    /// One iteration of the event loop: wait for a datagram until the next
    /// timer deadline (bounded by the soft timeout), feed any packet through
    /// the state machine, then fire everything that is due.
    pub fn run_once(&mut self) -> Result<(), Error> {
        let now = clock::timer_now();
        let timeout = self
            .sched
            .timeout_until_due(now)
            .unwrap_or(RECV_SOFT_TIMEOUT)
            .min(RECV_SOFT_TIMEOUT);

        let received = match &self.sock_in {
            Some(sock) => {
                // a zero duration would mean block forever
                sock.set_read_timeout(Some(Duration::from_micros(
                    timeout.max(1),
                )))?;
                Some(udp::recv_with_ttl(sock, &mut self.buf, &self.log))
            }
            None => {
                std::thread::sleep(Duration::from_micros(timeout.max(1)));
                None
            }
        };

        if let Some(result) = received {
            match result {
                Ok(dg) => {
                    let pkt = Control::from_bytes(&self.buf[..dg.len]);
                    match pkt {
                        Ok(pkt) => {
                            self.handle_control(pkt, dg.len, dg.src, dg.ttl)
                        }
                        Err(e) => debug!(self.log,
                            "discarding bogus packet from {}: {e}", dg.src),
                    }
                }
                Err(Error::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(Error::Truncated) => {
                    warn!(self.log, "recvmsg message truncated")
                }
                Err(e) => error!(self.log, "recv: {e}"),
            }
        }

        let now = clock::timer_now();
        while let Some(d) = self.sched.pop_due(now) {
            self.dispatch(d);
        }
        Ok(())
    }

    /// React to one due timer or immediate event. Sessions are looked up by
    /// name so a dispatch outliving its session (across a reload) is a
    /// no-op.
    pub(crate) fn dispatch(&mut self, d: Dispatch) {
        match d {
            Dispatch::Transmit(name) => {
                if let Some(idx) = self.store.index_of(&name) {
                    self.store.session_mut(idx).timer_tx = None;
                    self.transmit(idx, true);
                }
            }
            Dispatch::TransmitOnce(name) => {
                if let Some(idx) = self.store.index_of(&name) {
                    self.transmit(idx, false);
                }
            }
            Dispatch::Expire(name) => {
                if let Some(idx) = self.store.index_of(&name) {
                    self.store.session_mut(idx).timer_exp = None;
                    self.expire(idx);
                }
            }
            Dispatch::Reset(name) => {
                if let Some(idx) = self.store.index_of(&name) {
                    self.store.session_mut(idx).timer_rst = None;
                    self.reset(idx);
                }
            }
        }
    }

    /// Send one control packet. Periodic fires reschedule the sender; event
    /// fires (poll responses) do not. A send failure takes the instance to
    /// AdminDown.
    pub(crate) fn transmit(&mut self, idx: usize, periodic: bool) {
        if self.store.session(idx).is_admin_down() {
            return;
        }
        let (bytes, dest) = {
            let s = self.store.session(idx);
            let Some(neighbor) = s.neighbor else { return };
            (
                s.control_packet().to_bytes(),
                SocketAddr::new(neighbor, self.port),
            )
        };

        let sent = match self.store.session(idx).sock_out.as_ref() {
            Some(sk) => sk.send_to(&bytes, &dest.into()).map(|_| ()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no output socket",
            )),
        };
        if let Err(e) = sent {
            error!(self.log,
                "error sending packet, disabling instance: {e}";
                "instance" => &self.store.session(idx).name);
            self.state_admin_down(idx);
            return;
        }

        {
            let s = self.store.session_mut(idx);
            if s.r#final {
                s.r#final = false;
            }
        }

        if periodic && !self.store.session(idx).is_admin_down() {
            self.sender_schedule(idx);
        }
    }

    /// Detection time passed without a valid packet. RFC 5880 section 6.8.1
    /// requires the remote discriminator be cleared when the detection time
    /// expires.
    pub(crate) fn expire(&mut self, idx: usize) {
        let now = clock::timer_now();
        {
            let s = self.store.session_mut(idx);
            // the timer only runs in Up and Init
            if !(s.is_up() || s.is_init()) {
                return;
            }
            let dead_time = now.saturating_sub(s.last_seen.unwrap_or(now));
            let overdue = dead_time.saturating_sub(s.local_detect_time);
            warn!(self.log,
                "expired after {} ms ({} usec overdue)",
                dead_time / 1000, overdue;
                "instance" => &s.name);
            s.remote_discr = 0;
        }
        self.state_down(idx, crate::Diag::Expired);
    }

    /// The session sat in Down for a full detection time; reinitialize it to
    /// the initial template with a fresh discriminator.
    pub(crate) fn reset(&mut self, idx: usize) {
        let discr = self.store.alloc_discr();
        let s = self.store.session_mut(idx);
        debug!(self.log, "resetting to initial state";
            "instance" => &s.name);
        s.init_state(discr);
    }

    /// Schedule the next periodic transmission, jittered per packet. RFC
    /// 5880 section 6.8.2: reduce the interval by a random 0 to 25 percent,
    /// and keep it at no more than 90 percent of the negotiated interval
    /// when the detection multiplier is one.
    pub(crate) fn sender_schedule(&mut self, idx: usize) {
        let now = clock::timer_now();
        let sched = &mut self.sched;
        let s = self.store.session_mut(idx);
        let tx = s.local_tx_intv;
        let min_jitter = if s.local_detect_mult >= 1 { tx / 10 } else { 0 };
        let max_jitter = tx / 4;
        let jitter = if max_jitter > min_jitter {
            rand::thread_rng().gen_range(min_jitter..max_jitter)
        } else {
            min_jitter
        };
        let key =
            sched.add_timer(now, tx - jitter, Dispatch::Transmit(s.name.clone()));
        s.timer_tx = Some(key);
    }

    pub(crate) fn sender_cancel(&mut self, idx: usize) {
        let sched = &mut self.sched;
        if let Some(key) = self.store.session_mut(idx).timer_tx.take() {
            sched.cancel(key);
        }
    }

    /// Arm the expire timer for one detection time.
    pub(crate) fn expire_schedule(&mut self, idx: usize) {
        let now = clock::timer_now();
        let sched = &mut self.sched;
        let s = self.store.session_mut(idx);
        let key = sched.add_timer(
            now,
            s.local_detect_time,
            Dispatch::Expire(s.name.clone()),
        );
        s.timer_exp = Some(key);
    }

    pub(crate) fn expire_cancel(&mut self, idx: usize) {
        let sched = &mut self.sched;
        if let Some(key) = self.store.session_mut(idx).timer_exp.take() {
            sched.cancel(key);
        }
    }

    /// Arm the reset timer for one detection time.
    pub(crate) fn reset_schedule(&mut self, idx: usize) {
        let now = clock::timer_now();
        let sched = &mut self.sched;
        let s = self.store.session_mut(idx);
        if s.timer_rst.is_some() {
            return;
        }
        let key = sched.add_timer(
            now,
            s.local_detect_time,
            Dispatch::Reset(s.name.clone()),
        );
        s.timer_rst = Some(key);
    }

    pub(crate) fn reset_cancel(&mut self, idx: usize) {
        let sched = &mut self.sched;
        if let Some(key) = self.store.session_mut(idx).timer_rst.take() {
            sched.cancel(key);
        }
    }

    /// Debug snapshot of the session timing parameters, emitted when a
    /// received packet changed any derived interval.
    pub(crate) fn dump_timers(&self, idx: usize) {
        let s = self.store.session(idx);
        debug!(self.log, "session timing changed";
            "instance" => &s.name,
            "local_min_tx_ms" => s.local_min_tx_intv / 1000,
            "local_min_rx_ms" => s.local_min_rx_intv / 1000,
            "local_tx_ms" => s.local_tx_intv / 1000,
            "local_mult" => s.local_detect_mult,
            "local_detect_ms" => s.local_detect_time / 1000,
            "remote_min_tx_ms" => s.remote_min_tx_intv / 1000,
            "remote_min_rx_ms" => s.remote_min_rx_intv / 1000,
            "remote_tx_ms" => s.remote_tx_intv / 1000,
            "remote_mult" => s.remote_detect_mult,
            "remote_detect_ms" => s.remote_detect_time / 1000,
        );
    }
}
