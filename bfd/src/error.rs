// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Diag, SessionState};
use num_enum::TryFromPrimitiveError;
use std::net::IpAddr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("packet too small: {0} bytes")]
    TooSmall(usize),

    #[error("packet size mismatch: length field {header} bytes, buffer {wire} bytes")]
    LengthMismatch { header: u8, wire: usize },

    #[error("packet ttl {0} != 255")]
    BadTtl(u8),

    #[error("unsupported version {0}")]
    BadVersion(u8),

    #[error("detection multiplier field is zero")]
    ZeroDetectMult,

    #[error("multipoint flag set")]
    Multipoint,

    #[error("my discriminator field is zero")]
    ZeroMyDiscriminator,

    #[error("your discriminator field is zero and state field is {0}")]
    ZeroYourDiscriminator(SessionState),

    #[error("both poll and final flags set")]
    PollAndFinal,

    #[error("state field error")]
    InvalidState(#[from] TryFromPrimitiveError<SessionState>),

    #[error("diag field error")]
    InvalidDiag(#[from] TryFromPrimitiveError<Diag>),

    #[error("authentication is not supported")]
    AuthUnsupported,

    #[error("no session for discriminator {0}")]
    UnknownDiscriminator(u32),

    #[error("no session for source address {0}")]
    UnknownSource(IpAddr),

    #[error("message truncated")]
    Truncated,

    #[error("io {0}")]
    Io(#[from] std::io::Error),
}
