// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::packet::{Control, CONTROL_LEN};
use crate::sched::TimerKey;
use crate::{Diag, SessionState, BFD_VERSION};
use slog::{debug, Logger};
use socket2::Socket;
use std::net::IpAddr;

/// Default desired minimum transmit interval in milliseconds.
pub const MINTX_DEFAULT_MS: u64 = 10;

/// Default required minimum receive interval in milliseconds.
pub const MINRX_DEFAULT_MS: u64 = 10;

/// Default transmit interval while the session is not up, in milliseconds.
/// RFC 5880 section 6.8.3 requires at least one second.
pub const IDLETX_DEFAULT_MS: u64 = 1000;

/// Default detection time multiplier.
pub const MULTIPLIER_DEFAULT: u8 = 5;

/// A single BFD session with a neighbor. Configuration fields are fixed
/// between configuration loads; protocol state evolves as control packets are
/// exchanged; runtime handles tie the session into the dispatcher.
#[derive(Debug)]
pub struct Session {
    /// Operator-chosen instance name. At most 31 bytes, unique in the store.
    pub name: String,

    /// Neighbor address packets are sent to on the BFD control port.
    pub neighbor: Option<IpAddr>,

    /// Optional local address the output socket is bound to.
    pub source: Option<IpAddr>,

    /// Required minimum receive interval, microseconds.
    pub local_min_rx_intv: u64,

    /// Desired minimum transmit interval, microseconds.
    pub local_min_tx_intv: u64,

    /// Transmit interval used while the session is not up, microseconds.
    pub local_idle_tx_intv: u64,

    /// Local detection time multiplier.
    pub local_detect_mult: u8,

    /// True if the instance was disabled at configuration load.
    pub disabled: bool,

    pub local_state: SessionState,
    pub remote_state: SessionState,

    /// Local discriminator. Nonzero and unique across the store for the whole
    /// life of the session.
    pub local_discr: u32,

    /// Remote discriminator learned from the peer, zero until known.
    pub remote_discr: u32,

    pub local_diag: Diag,
    pub remote_diag: Diag,

    /// Remote desired minimum transmit interval, microseconds.
    pub remote_min_tx_intv: u64,

    /// Remote required minimum receive interval, microseconds.
    pub remote_min_rx_intv: u64,

    /// Local demand mode. This engine never originates demand mode, so the
    /// field only feeds the demand bit of outgoing packets.
    pub local_demand: bool,

    /// Remote demand mode as signalled by the peer.
    pub remote_demand: bool,

    pub remote_detect_mult: u8,

    /// Poll sequence in progress.
    pub poll: bool,

    /// A final-bit reply is owed to the peer. Cleared by the sender after
    /// each transmitted packet.
    pub r#final: bool,

    /// Negotiated local transmit interval, microseconds.
    pub local_tx_intv: u64,

    /// Negotiated remote transmit interval, microseconds.
    pub remote_tx_intv: u64,

    /// Local detection time, microseconds.
    pub local_detect_time: u64,

    /// Remote detection time, microseconds.
    pub remote_detect_time: u64,

    /// Monotonic stamp of the last valid packet from the neighbor.
    pub last_seen: Option<u64>,

    /// Output socket, open while the dispatcher is running.
    pub sock_out: Option<Socket>,

    pub timer_tx: Option<TimerKey>,
    pub timer_exp: Option<TimerKey>,
    pub timer_rst: Option<TimerKey>,

    /// Remaining time of each suspended timer, captured across a reload.
    /// Negative values mean the deadline had already passed at suspension.
    pub sands_tx: Option<i64>,
    pub sands_exp: Option<i64>,
    pub sands_rst: Option<i64>,
}

impl Session {
    /// Create a session with default parameters in the Down state. The
    /// discriminator starts at zero; the configuration loader assigns a
    /// unique random value before the session enters the store.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            neighbor: None,
            source: None,
            local_min_rx_intv: MINRX_DEFAULT_MS * 1000,
            local_min_tx_intv: MINTX_DEFAULT_MS * 1000,
            local_idle_tx_intv: IDLETX_DEFAULT_MS * 1000,
            local_detect_mult: MULTIPLIER_DEFAULT,
            disabled: false,
            local_state: SessionState::Down,
            remote_state: SessionState::Down,
            local_discr: 0,
            remote_discr: 0,
            local_diag: Diag::NoDiag,
            remote_diag: Diag::NoDiag,
            remote_min_tx_intv: 0,
            remote_min_rx_intv: 0,
            local_demand: false,
            remote_demand: false,
            remote_detect_mult: 0,
            poll: false,
            r#final: false,
            local_tx_intv: IDLETX_DEFAULT_MS * 1000,
            remote_tx_intv: 0,
            local_detect_time: 0,
            remote_detect_time: 0,
            last_seen: None,
            sock_out: None,
            timer_tx: None,
            timer_exp: None,
            timer_rst: None,
            sands_tx: None,
            sands_exp: None,
            sands_rst: None,
        }
    }

    pub fn is_admin_down(&self) -> bool {
        self.local_state == SessionState::AdminDown
    }

    pub fn is_down(&self) -> bool {
        self.local_state == SessionState::Down
    }

    pub fn is_init(&self) -> bool {
        self.local_state == SessionState::Init
    }

    pub fn is_up(&self) -> bool {
        self.local_state == SessionState::Up
    }

    /// Recompute the negotiated local transmit interval.
    pub fn update_local_tx_intv(&mut self) {
        self.local_tx_intv = self.local_min_tx_intv.max(self.remote_min_rx_intv);
    }

    /// Recompute the negotiated remote transmit interval.
    pub fn update_remote_tx_intv(&mut self) {
        self.remote_tx_intv =
            self.local_min_rx_intv.max(self.remote_min_tx_intv);
    }

    /// Fall back to the idle transmit interval. RFC 5880 section 6.8.3: when
    /// the session is not up, the desired transmit interval must be at least
    /// one second.
    pub fn idle_local_tx_intv(&mut self) {
        self.local_tx_intv = self.local_idle_tx_intv;
    }

    /// Begin a poll sequence. RFC 5880 allows changed parameters to ride on
    /// packets carrying the final bit of a sequence the peer initiated, so a
    /// pending final reply suppresses starting our own sequence.
    pub fn start_poll(&mut self, log: &Logger) {
        debug!(log, "starting poll sequence"; "instance" => &self.name);
        if !self.r#final {
            self.poll = true;
        }
    }

    /// Reinitialize protocol state to the initial template, keeping the
    /// configuration. The caller supplies a fresh discriminator that is
    /// unique across the store.
    pub fn init_state(&mut self, discr: u32) {
        self.local_state = SessionState::Down;
        self.remote_state = SessionState::Down;
        self.remote_discr = 0;
        self.local_diag = Diag::NoDiag;
        self.remote_diag = Diag::NoDiag;
        self.remote_min_tx_intv = 0;
        self.remote_min_rx_intv = 0;
        self.local_demand = false;
        self.remote_demand = false;
        self.remote_detect_mult = 0;
        self.poll = false;
        self.r#final = false;
        self.remote_tx_intv = 0;
        self.local_detect_time = 0;
        self.remote_detect_time = 0;
        self.last_seen = None;
        self.local_discr = discr;
        self.local_tx_intv = self.local_idle_tx_intv;
    }

    /// Copy protocol state from a pre-reload session with the same name.
    pub fn copy_state(&mut self, old: &Session) {
        self.local_state = old.local_state;
        self.remote_state = old.remote_state;
        self.local_discr = old.local_discr;
        self.remote_discr = old.remote_discr;
        self.local_diag = old.local_diag;
        self.remote_diag = old.remote_diag;
        self.remote_min_tx_intv = old.remote_min_tx_intv;
        self.remote_min_rx_intv = old.remote_min_rx_intv;
        self.local_demand = old.local_demand;
        self.remote_demand = old.remote_demand;
        self.remote_detect_mult = old.remote_detect_mult;
        self.poll = old.poll;
        self.r#final = old.r#final;
        self.local_tx_intv = old.local_tx_intv;
        self.remote_tx_intv = old.remote_tx_intv;
        self.local_detect_time = old.local_detect_time;
        self.remote_detect_time = old.remote_detect_time;
        self.last_seen = old.last_seen;
    }

    /// Copy suspended timer deadlines from a pre-reload session.
    pub fn copy_sands(&mut self, old: &Session) {
        self.sands_tx = old.sands_tx;
        self.sands_exp = old.sands_exp;
        self.sands_rst = old.sands_rst;
    }

    /// Build an outgoing control packet from the current session state. The
    /// final flag takes precedence over poll so a packet never carries both.
    pub fn control_packet(&self) -> Control {
        let mut pkt = Control {
            vers_diag: (BFD_VERSION << 5) | (self.local_diag as u8),
            detect_mult: self.local_detect_mult,
            length: CONTROL_LEN as u8,
            my_discriminator: self.local_discr,
            your_discriminator: self.remote_discr,
            desired_min_tx: self.local_min_tx_intv as u32,
            required_min_rx: self.local_min_rx_intv as u32,
            required_min_echo_rx: 0,
            ..Default::default()
        };
        pkt.set_state(self.local_state);
        if self.r#final {
            pkt.set_final();
        } else if self.poll {
            pkt.set_poll();
        }
        if self.local_demand {
            pkt.set_demand();
        }
        pkt
    }
}
