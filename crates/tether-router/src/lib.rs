//! Application-facing router and tunnel owner
//!
//! The [`Tunnel`] owns one router and two sessions. Applications enqueue
//! messages; the router picks whichever session can carry them, retries on
//! failure and forwards everything the peer sends back out of the tunnel.

pub mod config;
pub mod queue;
pub mod router;
pub mod tunnel;

pub use config::{RouterConfig, TunnelConfig};
pub use queue::OutboundQueue;
pub use router::Router;
pub use tunnel::{Tunnel, TunnelStatus};
