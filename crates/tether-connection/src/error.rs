//! Connection engine errors

use std::time::Duration;
use tether_proto::CommandError;
use tether_transport::TransportError;
use thiserror::Error;

/// Why a channel failed
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Framing error: {0}")]
    Framing(CommandError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No activity for {0:?}")]
    LivenessTimeout(Duration),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}

impl From<CommandError> for ConnectionError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Io(e) => ConnectionError::Transport(TransportError::IoError(e)),
            other => ConnectionError::Framing(other),
        }
    }
}

/// Synchronous refusal of a send; the channel itself is unaffected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueRejected {
    #[error("Connection is closed")]
    Closed,

    #[error("Queueing is disabled for this connection")]
    QueueingDisabled,

    #[error("Ping commands are never queued")]
    PingNotQueued,

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Engine timings that cannot work together
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("tick_interval must be greater than zero")]
    ZeroTick,

    #[error("worry_after ({worry:?}) must be shorter than late_after ({late:?})")]
    WorryNotBeforeLate { worry: Duration, late: Duration },

    #[error("late_after ({late:?}) must be longer than tick_interval ({tick:?})")]
    LateWithinTick { late: Duration, tick: Duration },
}
