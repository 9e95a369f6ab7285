// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bidirectional Forwarding Detection per RFC 5880 with single-hop IPv4/IPv6
//! transport per RFC 5881. Two peers exchange periodic control packets over
//! UDP; when one side stops receiving packets within the negotiated detection
//! time, it declares the path down and notifies a downstream consumer over an
//! event channel.
//!
//! The engine is built around a single-threaded dispatcher. Each session
//! couples the protocol state machine to three timers: a jittered transmit
//! timer, a detection-time expire timer, and a post-down reset timer. All
//! session state is mutated from dispatcher callbacks only, so no locking is
//! involved anywhere in the protocol path.

use num_enum::TryFromPrimitive;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod packet;
pub mod sched;
pub mod session;
mod sm;
pub mod store;
pub mod udp;

pub use dispatcher::Dispatcher;
pub use error::Error;

/// UDP port for single-hop BFD control packets per RFC 5881.
pub const BFD_CONTROL_PORT: u16 = 3784;

/// TTL required on both transmit and receipt (GTSM, RFC 5881).
pub const BFD_CONTROL_TTL: u8 = 255;

/// The only protocol version defined by RFC 5880.
pub const BFD_VERSION: u8 = 1;

/// Maximum instance name length in bytes.
pub const BFD_INAME_MAX: usize = 31;

/// The possible BFD session states, in their wire encoding.
#[derive(
    Default,
    PartialEq,
    Eq,
    Debug,
    Copy,
    Clone,
    TryFromPrimitive,
    JsonSchema,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum SessionState {
    /// A stable down state. Non-responsive to incoming messages.
    AdminDown = 0,

    /// The initial state.
    #[default]
    Down = 1,

    /// The local system has seen the remote peer in the down state.
    Init = 2,

    /// The local system has seen the remote peer in the init or up state
    /// while in the init state.
    Up = 3,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            SessionState::AdminDown => "AdminDown",
            SessionState::Down => "Down",
            SessionState::Init => "Init",
            SessionState::Up => "Up",
        };
        write!(f, "{}", s)
    }
}

/// Diagnostic codes explaining the local system's reason for its last session
/// state change, per RFC 5880 section 4.1.
#[derive(
    Default,
    PartialEq,
    Eq,
    Debug,
    Copy,
    Clone,
    TryFromPrimitive,
    JsonSchema,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Diag {
    #[default]
    NoDiag = 0,
    Expired = 1,
    EchoFailed = 2,
    NbrSignalledDown = 3,
    FwdPlaneReset = 4,
    PathDown = 5,
    CatPathDown = 6,
    AdminDown = 7,
    RcatPathDown = 8,
}

impl fmt::Display for Diag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Diag::NoDiag => "No Diagnostic",
            Diag::Expired => "Control Detection Time Expired",
            Diag::EchoFailed => "Echo Function Failed",
            Diag::NbrSignalledDown => "Neighbor Signaled Session Down",
            Diag::FwdPlaneReset => "Forwarding Plane Reset",
            Diag::PathDown => "Path Down",
            Diag::CatPathDown => "Concatenated Path Down",
            Diag::AdminDown => "Administratively Down",
            Diag::RcatPathDown => "Reverse Concatenated Path Down",
        };
        write!(f, "{}", s)
    }
}

//TODO use IpAddr::to_canonical once it stabilizes.
pub fn to_canonical(addr: IpAddr) -> IpAddr {
    match addr {
        v6 @ IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => v6,
        },
        v4 @ IpAddr::V4(_) => v4,
    }
}

#[cfg(test)]
pub(crate) fn test_logger() -> slog::Logger {
    use slog::Drain;
    let drain = slog_bunyan::new(std::io::stdout()).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x8000)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}
