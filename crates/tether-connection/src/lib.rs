//! Connection engine for a single tether channel
//!
//! Frames commands onto a transport stream, detects dead peers without
//! transport keepalives, serializes sends and hands undelivered work back to
//! the owner when the channel fails.

pub mod config;
pub mod engine;
pub mod error;
pub mod pending;

pub use config::EngineConfig;
pub use engine::{
    ConnectionEngine, EngineEvent, EngineEventKind, EngineId, EngineNotice, EngineState,
    SendOutcome,
};
pub use error::{ConfigError, ConnectionError, QueueRejected};
pub use pending::{PendingItem, PendingQueue};
