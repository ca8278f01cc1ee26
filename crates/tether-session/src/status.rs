//! Session status labels and the shared snapshot read by other tasks

use crate::Role;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Stopped,
    Starting,
    Connecting,
    WaitingForConnection,
    Connected,
    SentData,
    ReceivedData,
    ConnectionFailed,
    ConnectionLost,
    Disconnecting,
    Disconnected,
    TransportUnavailable,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Stopped => "Stopped",
            SessionState::Starting => "Starting",
            SessionState::Connecting => "Connecting",
            SessionState::WaitingForConnection => "Waiting for connection",
            SessionState::Connected => "Connected",
            SessionState::SentData => "Sent Data",
            SessionState::ReceivedData => "Received Data",
            SessionState::ConnectionFailed => "Connection Failed",
            SessionState::ConnectionLost => "Connection Lost",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Disconnected => "Disconnected",
            SessionState::TransportUnavailable => "Transport unavailable",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub role: Role,
    pub state: SessionState,
    pub connected: bool,
    pub running: bool,
    pub failures: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SessionStatus {
    fn new(role: Role) -> Self {
        Self {
            role,
            state: SessionState::Stopped,
            connected: false,
            running: false,
            failures: 0,
            last_activity: None,
        }
    }
}

/// State shared between the session loop and its handles
#[derive(Debug)]
pub(crate) struct SessionShared {
    status: RwLock<SessionStatus>,
    outstanding: AtomicUsize,
    awaiting_open: AtomicBool,
    holds: AtomicUsize,
}

impl SessionShared {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            status: RwLock::new(SessionStatus::new(role)),
            outstanding: AtomicUsize::new(0),
            awaiting_open: AtomicBool::new(false),
            holds: AtomicUsize::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionStatus> {
        self.status.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionStatus> {
        self.status.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn snapshot(&self) -> SessionStatus {
        self.read().clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut SessionStatus)) {
        f(&mut self.write());
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.write().state = state;
    }

    pub(crate) fn touch(&self) {
        self.write().last_activity = Some(Utc::now());
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.read().connected
    }

    pub(crate) fn is_running(&self) -> bool {
        self.read().running
    }

    pub(crate) fn acquire(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// Settle `n` packets that were delivered, returned or dropped
    pub(crate) fn settle(&self, n: usize) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(n))
            });
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// The engine refuses sends until its channel opens
    pub(crate) fn set_awaiting_open(&self, awaiting: bool) {
        self.awaiting_open.store(awaiting, Ordering::SeqCst);
    }

    pub(crate) fn is_awaiting_open(&self) -> bool {
        self.awaiting_open.load(Ordering::SeqCst)
    }

    pub(crate) fn hold(&self) {
        self.holds.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.holds.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn is_held(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(SessionState::WaitingForConnection.to_string(), "Waiting for connection");
        assert_eq!(SessionState::SentData.to_string(), "Sent Data");
        assert_eq!(SessionState::TransportUnavailable.to_string(), "Transport unavailable");
    }

    #[test]
    fn test_outstanding_never_underflows() {
        let shared = SessionShared::new(Role::Initiator);
        shared.acquire();
        shared.settle(3);
        assert_eq!(shared.outstanding(), 0);
    }

    #[test]
    fn test_status_serializes_with_role() {
        let shared = SessionShared::new(Role::Acceptor);
        shared.update(|s| {
            s.connected = true;
            s.state = SessionState::Connected;
        });

        let json = serde_json::to_value(shared.snapshot()).unwrap();
        assert_eq!(json["role"], "acceptor");
        assert_eq!(json["state"], "Connected");
        assert_eq!(json["connected"], true);
    }
}
