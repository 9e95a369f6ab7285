// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::{Diag, SessionState, BFD_CONTROL_TTL, BFD_VERSION};

/// Size of a BFD control packet without an authentication section.
pub const CONTROL_LEN: usize = 24;

// Control packet flags.
const POLL: u8 = 1 << 5;
const FINAL: u8 = 1 << 4;
const CONTROL_PLANE_INDEPENDENT: u8 = 1 << 3;
const AUTHENTICATION_PRESENT: u8 = 1 << 2;
const DEMAND: u8 = 1 << 1;
const MULTIPOINT: u8 = 1;

/// The BFD control packet per RFC 5880 section 4.1.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Vers |  Diag   |Sta|P|F|C|A|D|M|  Detect Mult  |    Length     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       My Discriminator                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Your Discriminator                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Desired Min TX Interval                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   Required Min RX Interval                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Required Min Echo RX Interval                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The header is serialized and deserialized byte by byte rather than through
/// a struct overlay, so the layout is independent of host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    /// The protocol version in the upper three bits and the diagnostic code
    /// for the last local state change in the lower five.
    pub vers_diag: u8,

    /// Session state in the upper two bits, followed by the poll, final,
    /// control plane independent, authentication present, demand and
    /// multipoint flags.
    pub flags: u8,

    /// Detection time multiplier. The negotiated transmit interval multiplied
    /// by this value gives the detection time used by the receiving system.
    pub detect_mult: u8,

    /// Length of the packet in bytes.
    pub length: u8,

    /// A unique, nonzero discriminator generated by the transmitting system,
    /// used to demultiplex sessions between the same pair of systems.
    pub my_discriminator: u32,

    /// The discriminator received from the remote system, or zero if that
    /// value is not yet known.
    pub your_discriminator: u32,

    /// Minimum interval, in microseconds, the local system would like to use
    /// when transmitting control packets.
    pub desired_min_tx: u32,

    /// Minimum interval, in microseconds, between received control packets
    /// that the transmitting system can support.
    pub required_min_rx: u32,

    /// Echo function support interval. Always zero: the Echo function is not
    /// supported by this engine.
    pub required_min_echo_rx: u32,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            vers_diag: BFD_VERSION << 5,
            flags: SessionState::Down.wire_format(),
            detect_mult: 0,
            length: CONTROL_LEN as u8,
            my_discriminator: 0,
            your_discriminator: 0,
            desired_min_tx: 0,
            required_min_rx: 0,
            required_min_echo_rx: 0,
        }
    }
}

impl Control {
    /// Deserialize an array of bytes as a `Control`.
    pub fn from_bytes(d: &[u8]) -> Result<Self, Error> {
        if d.len() < CONTROL_LEN {
            return Err(Error::TooSmall(d.len()));
        }
        Ok(Self {
            vers_diag: d[0],
            flags: d[1],
            detect_mult: d[2],
            length: d[3],
            my_discriminator: u32::from_be_bytes([d[4], d[5], d[6], d[7]]),
            your_discriminator: u32::from_be_bytes([d[8], d[9], d[10], d[11]]),
            desired_min_tx: u32::from_be_bytes([d[12], d[13], d[14], d[15]]),
            required_min_rx: u32::from_be_bytes([d[16], d[17], d[18], d[19]]),
            required_min_echo_rx: u32::from_be_bytes([
                d[20], d[21], d[22], d[23],
            ]),
        })
    }

    /// Serialize a `Control` as a vector of bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v =
            vec![self.vers_diag, self.flags, self.detect_mult, self.length];
        v.extend_from_slice(&self.my_discriminator.to_be_bytes());
        v.extend_from_slice(&self.your_discriminator.to_be_bytes());
        v.extend_from_slice(&self.desired_min_tx.to_be_bytes());
        v.extend_from_slice(&self.required_min_rx.to_be_bytes());
        v.extend_from_slice(&self.required_min_echo_rx.to_be_bytes());
        v
    }

    /// Sanity checks for an inbound packet per RFC 5880 section 6.8.6 and the
    /// GTSM rule of RFC 5881. `wire_len` is the number of bytes received from
    /// the wire and `ttl` the IP TTL or hop limit when it was observable.
    pub fn check(&self, wire_len: usize, ttl: Option<u8>) -> Result<(), Error> {
        if wire_len < CONTROL_LEN {
            return Err(Error::TooSmall(wire_len));
        }
        if self.length as usize != wire_len {
            return Err(Error::LengthMismatch {
                header: self.length,
                wire: wire_len,
            });
        }
        if let Some(t) = ttl {
            if t != BFD_CONTROL_TTL {
                return Err(Error::BadTtl(t));
            }
        }
        if self.version() != BFD_VERSION {
            return Err(Error::BadVersion(self.version()));
        }
        if self.detect_mult == 0 {
            return Err(Error::ZeroDetectMult);
        }
        if self.multipoint() {
            return Err(Error::Multipoint);
        }
        if self.my_discriminator == 0 {
            return Err(Error::ZeroMyDiscriminator);
        }
        let state = self.state()?;
        if self.your_discriminator == 0
            && state != SessionState::Down
            && state != SessionState::AdminDown
        {
            return Err(Error::ZeroYourDiscriminator(state));
        }
        if self.poll() && self.r#final() {
            return Err(Error::PollAndFinal);
        }
        self.diag()?;
        if self.authentication_present() {
            return Err(Error::AuthUnsupported);
        }
        Ok(())
    }

    /// Get the version number from the packet.
    pub fn version(&self) -> u8 {
        self.vers_diag >> 5
    }

    /// Get the diagnostic code from the packet.
    pub fn diag(&self) -> Result<Diag, Error> {
        Ok(Diag::try_from(self.vers_diag & 0b00011111)?)
    }

    /// Set the diagnostic code in the packet.
    pub fn set_diag(&mut self, d: Diag) {
        self.vers_diag = (self.vers_diag & 0b11100000) | (d as u8);
    }

    /// Get the session state from the packet.
    pub fn state(&self) -> Result<SessionState, Error> {
        Ok(SessionState::try_from((self.flags & 0b11000000) >> 6)?)
    }

    /// Set the session state in the packet.
    pub fn set_state(&mut self, s: SessionState) {
        self.flags = (self.flags & 0b00111111) | s.wire_format();
    }

    /// Returns true if the poll flag is set.
    pub fn poll(&self) -> bool {
        (self.flags & POLL) != 0
    }

    /// Set the poll flag to true.
    pub fn set_poll(&mut self) {
        self.flags |= POLL;
    }

    /// Returns true if the final flag is set.
    pub fn r#final(&self) -> bool {
        (self.flags & FINAL) != 0
    }

    /// Set the final flag to true.
    pub fn set_final(&mut self) {
        self.flags |= FINAL;
    }

    /// Returns true if the control plane independent flag is set.
    pub fn control_plane_independent(&self) -> bool {
        (self.flags & CONTROL_PLANE_INDEPENDENT) != 0
    }

    /// Returns true if the authentication present flag is set.
    pub fn authentication_present(&self) -> bool {
        (self.flags & AUTHENTICATION_PRESENT) != 0
    }

    /// Set the authentication present flag to true.
    pub fn set_authentication_present(&mut self) {
        self.flags |= AUTHENTICATION_PRESENT;
    }

    /// Returns true if the demand mode flag is set.
    pub fn demand(&self) -> bool {
        (self.flags & DEMAND) != 0
    }

    /// Set the demand mode flag to true.
    pub fn set_demand(&mut self) {
        self.flags |= DEMAND;
    }

    /// Returns true if the multipoint flag is set.
    pub fn multipoint(&self) -> bool {
        (self.flags & MULTIPOINT) != 0
    }

    /// Set the multipoint flag to true.
    pub fn set_multipoint(&mut self) {
        self.flags |= MULTIPOINT;
    }
}

impl SessionState {
    /// Shift an enum value into its position in the packet flags byte.
    fn wire_format(&self) -> u8 {
        (*self as u8) << 6
    }
}
