//! Tether Protocol Definitions
//!
//! This crate defines the wire-level pieces shared by both peers: the
//! command frame and its codec, the structured message token format, and the
//! delivery opcodes that tie the two together.

pub mod codec;
pub mod command;
pub mod delivery;
pub mod message;

pub use codec::{CommandCodec, CommandError};
pub use command::{ByteOrder, Command, PING, PING_ID};
pub use delivery::Delivery;
pub use message::{FieldValue, MessageCodec, MessageError, StructuredMessage};

/// Default maximum payload size for a single command (1MB)
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Size of the payload length prefix on the wire
pub const LENGTH_PREFIX_SIZE: usize = 4;
