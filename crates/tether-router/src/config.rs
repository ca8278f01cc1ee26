//! Router and tunnel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_connection::config::duration_ms;
use tether_connection::ConfigError;
use tether_proto::ByteOrder;
use tether_session::{AcceptorPolicy, InitiatorPolicy};

/// Outbound queue and dispatch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Packets kept before the oldest are dropped
    pub capacity: usize,

    /// Age after which a queued packet is dropped
    #[serde(with = "duration_ms")]
    pub max_age: Duration,

    /// Wait after an initiator failure before dialing again
    #[serde(with = "duration_ms")]
    pub initiator_cooldown: Duration,

    /// Delay of the retry scheduled while the cooldown runs
    #[serde(with = "duration_ms")]
    pub retry_after: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_age: Duration::from_secs(30),
            initiator_cooldown: Duration::from_secs(5),
            retry_after: Duration::from_secs(1),
        }
    }
}

/// Everything needed to run a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub router: RouterConfig,
    pub acceptor: AcceptorPolicy,
    pub initiator: InitiatorPolicy,
}

impl TunnelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the same length-prefix byte order on both roles
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.acceptor.engine.byte_order = order;
        self.initiator.engine.byte_order = order;
        self
    }

    /// Liveness tick for both roles; worry and late scale with it
    pub fn tick_interval(mut self, tick: Duration) -> Self {
        self.acceptor.engine = self.acceptor.engine.with_tick_interval(tick);
        self.initiator.engine = self.initiator.engine.with_tick_interval(tick);
        self
    }

    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.initiator.max_failures = max_failures;
        self
    }

    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.initiator.idle_timeout = idle;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.router.capacity = capacity;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.router.max_age = max_age;
        self
    }

    /// Check both engines' liveness timings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.acceptor.engine.validate()?;
        self.initiator.engine.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.router.capacity, 100);
        assert_eq!(config.router.max_age, Duration::from_secs(30));
        assert_eq!(config.router.initiator_cooldown, Duration::from_secs(5));
        assert_eq!(config.router.retry_after, Duration::from_secs(1));
        assert_eq!(config.acceptor.reconnect_after_loss, Duration::from_millis(250));
        assert_eq!(config.initiator.max_failures, 5);
    }

    #[test]
    fn test_builder() {
        let config = TunnelConfig::new()
            .byte_order(ByteOrder::Little)
            .tick_interval(Duration::from_millis(500))
            .max_failures(2)
            .queue_capacity(10);

        assert_eq!(config.acceptor.engine.byte_order, ByteOrder::Little);
        assert_eq!(config.initiator.engine.late_after, Duration::from_secs(2));
        assert_eq!(config.initiator.max_failures, 2);
        assert_eq!(config.router.capacity, 10);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
router:
  capacity: 5
  max_age: 1500
initiator:
  idle_timeout: 3000
  engine:
    byte_order: little
"#;
        let config: TunnelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.router.capacity, 5);
        assert_eq!(config.router.max_age, Duration::from_millis(1500));
        assert_eq!(config.router.retry_after, Duration::from_secs(1));
        assert_eq!(config.initiator.idle_timeout, Duration::from_secs(3));
        assert_eq!(config.initiator.engine.byte_order, ByteOrder::Little);
        assert_eq!(config.acceptor, AcceptorPolicy::default());
    }

    #[test]
    fn test_validate_checks_both_engines() {
        assert_eq!(TunnelConfig::default().validate(), Ok(()));
        assert_eq!(
            TunnelConfig::new()
                .tick_interval(Duration::from_secs(5))
                .validate(),
            Ok(())
        );

        let yaml = r#"
acceptor:
  engine:
    tick_interval: 5000
"#;
        let config: TunnelConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LateWithinTick { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip_keeps_millis() {
        let json = serde_json::to_value(TunnelConfig::default()).unwrap();
        assert_eq!(json["router"]["max_age"], 30000);
        assert_eq!(json["initiator"]["idle_timeout"], 15000);
        assert_eq!(json["acceptor"]["reconnect_after_failure"], 10000);
    }
}
