//! In-process transport built on `tokio::io::duplex`
//!
//! Used to wire two tunnels together inside one process and to drive the
//! session logic in tests without sockets.

use crate::{Connector, TransportError, TransportResult, TransportStream};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const BACKLOG: usize = 8;

/// Create a connected acceptor/dialer pair
///
/// Each successful dial creates a fresh duplex pipe with `capacity` bytes of
/// buffering per direction and hands one end to the acceptor.
pub fn memory_pair(capacity: usize) -> (MemoryAcceptor, MemoryDialer) {
    let (tx, rx) = mpsc::channel(BACKLOG);
    let enabled = Arc::new(AtomicBool::new(true));

    let acceptor = MemoryAcceptor {
        incoming: Arc::new(Mutex::new(rx)),
        enabled: enabled.clone(),
    };
    let dialer = MemoryDialer {
        outgoing: tx,
        capacity,
        enabled,
        attempts: Arc::new(AtomicUsize::new(0)),
    };

    (acceptor, dialer)
}

#[derive(Debug, Clone)]
pub struct MemoryAcceptor {
    incoming: Arc<Mutex<mpsc::Receiver<DuplexStream>>>,
    enabled: Arc<AtomicBool>,
}

impl MemoryAcceptor {
    /// Toggle availability of the pair (both ends share the flag)
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryAcceptor {
    async fn connect(&self) -> TransportResult<TransportStream> {
        if !self.is_enabled() {
            return Err(TransportError::Disabled);
        }

        let mut incoming = self.incoming.lock().await;
        let io = incoming.recv().await.ok_or(TransportError::Closed)?;
        debug!("Accepted in-memory peer");
        Ok(TransportStream::from_io(io, "memory-dialer"))
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryDialer {
    outgoing: mpsc::Sender<DuplexStream>,
    capacity: usize,
    enabled: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryDialer {
    /// Number of `connect` calls so far, successful or not
    pub fn dial_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryDialer {
    async fn connect(&self) -> TransportResult<TransportStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.is_enabled() {
            return Err(TransportError::Disabled);
        }

        let (local, remote) = tokio::io::duplex(self.capacity);
        self.outgoing
            .send(remote)
            .await
            .map_err(|_| TransportError::ConnectionError("No acceptor listening".to_string()))?;

        Ok(TransportStream::from_io(local, "memory-acceptor"))
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
