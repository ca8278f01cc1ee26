//! Role policies
//!
//! The session loop is the same for both roles. What differs is how each
//! role reacts to a failed or lost channel and whether it lingers when idle.

use crate::Role;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_connection::config::duration_ms;
use tether_connection::EngineConfig;
use tracing::warn;

/// What happens to undelivered packets after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leftovers {
    Return,
    Discard,
}

/// What the session does after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Reconnect(Duration),
    /// Wait for an explicit reset
    Park,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDecision {
    pub leftovers: Leftovers,
    pub next: NextStep,
}

pub trait RolePolicy: Send + 'static {
    fn role(&self) -> Role;

    fn engine_config(&self) -> EngineConfig;

    /// The channel opened
    fn on_connected(&mut self);

    /// The channel failed (`lost` = it had been open)
    fn on_failure(&mut self, lost: bool, transport_enabled: bool) -> FailureDecision;

    /// Consecutive failures since the last successful open
    fn failures(&self) -> u32;

    /// Time without application traffic after which the session stops itself
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether a reset means stop rather than reconnect
    fn reset_stops(&self) -> bool {
        false
    }
}

/// Passive role policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptorPolicy {
    #[serde(with = "duration_ms")]
    pub reconnect_after_loss: Duration,

    #[serde(with = "duration_ms")]
    pub reconnect_after_failure: Duration,

    pub engine: EngineConfig,

    #[serde(skip)]
    failures: u32,
}

impl Default for AcceptorPolicy {
    fn default() -> Self {
        Self {
            reconnect_after_loss: Duration::from_millis(250),
            reconnect_after_failure: Duration::from_secs(10),
            engine: EngineConfig::acceptor(),
            failures: 0,
        }
    }
}

impl RolePolicy for AcceptorPolicy {
    fn role(&self) -> Role {
        Role::Acceptor
    }

    fn engine_config(&self) -> EngineConfig {
        self.engine.clone()
    }

    fn on_connected(&mut self) {
        self.failures = 0;
    }

    fn on_failure(&mut self, lost: bool, transport_enabled: bool) -> FailureDecision {
        self.failures = self.failures.saturating_add(1);

        let next = if lost {
            NextStep::Reconnect(self.reconnect_after_loss)
        } else if transport_enabled {
            NextStep::Reconnect(self.reconnect_after_failure)
        } else {
            NextStep::Park
        };

        FailureDecision {
            leftovers: Leftovers::Return,
            next,
        }
    }

    fn failures(&self) -> u32 {
        self.failures
    }
}

/// Active role policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitiatorPolicy {
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Consecutive failures tolerated before leftovers are discarded
    pub max_failures: u32,

    pub engine: EngineConfig,

    #[serde(skip)]
    failures: u32,
}

impl Default for InitiatorPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            max_failures: 5,
            engine: EngineConfig::initiator(),
            failures: 0,
        }
    }
}

impl RolePolicy for InitiatorPolicy {
    fn role(&self) -> Role {
        Role::Initiator
    }

    fn engine_config(&self) -> EngineConfig {
        self.engine.clone()
    }

    fn on_connected(&mut self) {
        self.failures = 0;
    }

    fn on_failure(&mut self, _lost: bool, _transport_enabled: bool) -> FailureDecision {
        self.failures = self.failures.saturating_add(1);

        let leftovers = if self.failures > self.max_failures {
            warn!(
                failures = self.failures,
                max = self.max_failures,
                "Too many consecutive failures, discarding undelivered packets"
            );
            Leftovers::Discard
        } else {
            Leftovers::Return
        };

        FailureDecision {
            leftovers,
            next: NextStep::Shutdown,
        }
    }

    fn failures(&self) -> u32 {
        self.failures
    }

    fn idle_timeout(&self) -> Option<Duration> {
        Some(self.idle_timeout)
    }

    fn reset_stops(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptor_backoff() {
        let mut policy = AcceptorPolicy::default();

        let lost = policy.on_failure(true, true);
        assert_eq!(lost.next, NextStep::Reconnect(Duration::from_millis(250)));
        assert_eq!(lost.leftovers, Leftovers::Return);

        let failed = policy.on_failure(false, true);
        assert_eq!(failed.next, NextStep::Reconnect(Duration::from_secs(10)));

        let disabled = policy.on_failure(false, false);
        assert_eq!(disabled.next, NextStep::Park);
        assert_eq!(policy.failures(), 3);

        policy.on_connected();
        assert_eq!(policy.failures(), 0);
    }

    #[test]
    fn test_initiator_discards_past_threshold() {
        let mut policy = InitiatorPolicy::default();

        for _ in 0..5 {
            let decision = policy.on_failure(false, true);
            assert_eq!(decision.leftovers, Leftovers::Return);
            assert_eq!(decision.next, NextStep::Shutdown);
        }
        assert_eq!(policy.on_failure(true, true).leftovers, Leftovers::Discard);

        policy.on_connected();
        assert_eq!(policy.on_failure(false, true).leftovers, Leftovers::Return);
    }

    #[test]
    fn test_policy_config_from_json() {
        let policy: InitiatorPolicy =
            serde_json::from_str(r#"{"idle_timeout": 2000, "max_failures": 1}"#).unwrap();
        assert_eq!(policy.idle_timeout, Duration::from_secs(2));
        assert_eq!(policy.max_failures, 1);
        assert_eq!(policy.engine.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(policy.failures(), 0);
    }
}
