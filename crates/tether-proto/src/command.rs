//! Command primitives carried on the wire

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Reserved command type used for liveness probes.
///
/// Never surfaced to the application layer.
pub const PING: u8 = u8::MAX;

/// Send id paired with [`PING`]; completions carrying it are not reported.
pub const PING_ID: u32 = u32::MAX;

/// Byte order of the payload length prefix, fixed per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    pub fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        }
    }

    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        }
    }
}

/// A single command: an opcode plus an optional payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: u8,
    pub payload: Bytes,
}

impl Command {
    pub fn new(kind: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// A command with no payload
    pub fn empty(kind: u8) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    pub fn ping() -> Self {
        Self::empty(PING)
    }

    pub fn is_ping(&self) -> bool {
        self.kind == PING
    }

    /// Whether this command type is followed by a length-prefixed payload.
    pub fn requires_payload(kind: u8) -> bool {
        kind != PING
    }
}
