//! Role-aware sessions around the connection engine
//!
//! A session owns one [`tether_connection::ConnectionEngine`] at a time and
//! replaces it on every reconnect. Two roles share the same session loop and
//! differ only in their [`RolePolicy`]:
//!
//! - the **acceptor** waits for a peer, reconnects forever and never gives up
//!   queued work
//! - the **initiator** dials on demand, hands work back to the router when it
//!   fails and tears itself down when idle

pub mod error;
pub mod packet;
pub mod policy;
pub mod session;
pub mod status;

pub use error::SessionError;
pub use packet::{Inbound, Packet};
pub use policy::{AcceptorPolicy, FailureDecision, InitiatorPolicy, Leftovers, NextStep, RolePolicy};
pub use session::{HoldGuard, Session, SessionHandle};
pub use status::{SessionState, SessionStatus};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the channel a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Acceptor,
    Initiator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Acceptor => f.write_str("acceptor"),
            Role::Initiator => f.write_str("initiator"),
        }
    }
}

/// Session outcome reported to the router
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Delivered { id: u32 },
    /// The channel failed; `leftovers` are packets the router should retry
    SendFailed { leftovers: Vec<Packet> },
    /// Packets the session could not take; not a channel failure
    Returned { packets: Vec<Packet> },
    Stopped,
    Received(Inbound),
}

/// A [`SessionEvent`] tagged with the reporting role
#[derive(Debug)]
pub struct SessionReport {
    pub role: Role,
    pub event: SessionEvent,
}

/// What the router needs from a session
///
/// Every call is non-blocking; commands are posted to the session loop.
pub trait SessionLink: Send + Sync {
    fn is_connected(&self) -> bool;
    fn is_running(&self) -> bool;
    /// A packet handed to the session is still pending, or the session
    /// cannot take packets until its channel opens
    fn is_busy(&self) -> bool;
    /// Whether the session's transport can be used at all
    fn is_enabled(&self) -> bool;
    fn start(&self);
    fn send(&self, packet: Packet);
    fn reset(&self);
}
