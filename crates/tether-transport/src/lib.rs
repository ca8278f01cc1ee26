//! Transport boundary for tether sessions
//!
//! A session only needs an ordered byte stream to its peer. How that stream
//! comes to exist depends on the role: the acceptor waits for one peer to
//! connect, the initiator dials one. Both are expressed through the same
//! [`Connector`] trait so the session logic never touches a socket type.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        tether-session (both roles)       │
//! └──────────────────────────────────────────┘
//!                      │ Connector::connect()
//!                      ↓
//! ┌──────────────┬──────────────┬────────────┐
//! │ TcpAcceptor  │ TcpDialer    │ memory_pair│
//! └──────────────┴──────────────┴────────────┘
//! ```

pub mod memory;
pub mod tcp;

pub use memory::{memory_pair, MemoryAcceptor, MemoryDialer};
pub use tcp::{TcpAcceptor, TcpDialer};

use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Transport disabled")]
    Disabled,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// An established byte stream to the peer, already split into halves
pub struct TransportStream {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub peer: String,
}

impl TransportStream {
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            peer: peer.into(),
        }
    }

    /// Split a single duplex IO object into a stream
    pub fn from_io<S>(io: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(reader, writer, peer)
    }

    pub fn into_parts(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Produces one transport stream per call
///
/// For an acceptor this waits for the next peer; for an initiator it dials
/// out. Dropping the returned future abandons the attempt.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self) -> TransportResult<TransportStream>;

    /// Whether the underlying transport is currently usable
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Connector for a role that has no transport configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConnector;

#[async_trait]
impl Connector for NullConnector {
    async fn connect(&self) -> TransportResult<TransportStream> {
        Err(TransportError::Disabled)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
