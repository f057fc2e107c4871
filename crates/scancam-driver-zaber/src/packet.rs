//! Six-byte binary frame codec.
//!
//! Frame layout: `[address][command][data: i32 little-endian]`.

use std::fmt;

use crate::protocol::{CommandKind, ERROR_REPLY};

/// Size of one frame on the wire.
pub const FRAME_LEN: usize = 6;

/// Address that every device on the chain answers to.
pub const BROADCAST_ADDRESS: u8 = 0;

/// One request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Packet {
    /// Device number on the chain
    pub address: u8,
    /// Command code
    pub command: u8,
    /// Signed payload
    pub data: i32,
}

impl Packet {
    /// Build a packet.
    pub fn new(address: u8, command: u8, data: i32) -> Self {
        Self {
            address,
            command,
            data,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let d = self.data.to_le_bytes();
        [self.address, self.command, d[0], d[1], d[2], d[3]]
    }

    /// Decode wire bytes.
    pub fn decode(frame: &[u8; FRAME_LEN]) -> Self {
        Self {
            address: frame[0],
            command: frame[1],
            data: i32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]),
        }
    }

    /// Whether this is an error reply.
    pub fn is_error(&self) -> bool {
        self.command == ERROR_REPLY
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match CommandKind::from_code(self.command) {
            Some(kind) => write!(f, "#{} {}: {}", self.address, kind, self.data),
            None if self.is_error() => write!(f, "#{} error: {}", self.address, self.data),
            None => write!(f, "#{} cmd {}: {}", self.address, self.command, self.data),
        }
    }
}
