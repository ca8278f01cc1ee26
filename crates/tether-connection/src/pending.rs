//! Pending send bookkeeping

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tether_proto::Command;
use tokio::time::Instant;

/// One outstanding send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    pub id: u32,
    pub command: Command,
    pub created_at: Instant,
}

impl PendingItem {
    pub fn new(id: u32, command: Command) -> Self {
        Self {
            id,
            command,
            created_at: Instant::now(),
        }
    }
}

/// FIFO of sends waiting for the channel
///
/// Every access takes the queue-wide lock. Clones share the same queue so
/// status readers on other threads see the live length.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    inner: Arc<Mutex<VecDeque<PendingItem>>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingItem>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: PendingItem) {
        self.lock().push_back(item);
    }

    pub fn pop(&self) -> Option<PendingItem> {
        self.lock().pop_front()
    }

    /// Remove and return every queued item in order
    pub fn drain(&self) -> Vec<PendingItem> {
        self.lock().drain(..).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
