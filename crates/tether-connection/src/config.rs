//! Engine configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_proto::{ByteOrder, CommandCodec, DEFAULT_MAX_PAYLOAD};

/// Default liveness tick
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Default dial timeout for the initiator role
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Byte order of the payload length prefix
    pub byte_order: ByteOrder,

    /// Largest payload accepted for a single command
    pub max_payload: usize,

    /// Period of the liveness check
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,

    /// Idle time after which a PING is sent
    #[serde(with = "duration_ms")]
    pub worry_after: Duration,

    /// Idle time after which the channel is declared dead
    #[serde(with = "duration_ms")]
    pub late_after: Duration,

    /// Whether sends may wait for the channel instead of being refused
    pub can_queue: bool,

    /// Upper bound on establishing the transport; unset waits forever
    #[serde(with = "option_duration_ms")]
    pub connect_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::Big,
            max_payload: DEFAULT_MAX_PAYLOAD,
            tick_interval: DEFAULT_TICK_INTERVAL,
            worry_after: DEFAULT_TICK_INTERVAL * 3,
            late_after: DEFAULT_TICK_INTERVAL * 4,
            can_queue: true,
            connect_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Defaults for the passive role
    pub fn acceptor() -> Self {
        Self::default()
    }

    /// Defaults for the active role
    pub fn initiator() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            ..Self::default()
        }
    }

    /// Set the tick and derive worry (3 ticks) and late (4 ticks) from it
    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self.worry_after = tick * 3;
        self.late_after = tick * 4;
        self
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_queueing(mut self, can_queue: bool) -> Self {
        self.can_queue = can_queue;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Check that the liveness thresholds fit the tick
    ///
    /// Keys missing from a config file keep their defaults, so a file that
    /// only raises `tick_interval` can leave `late_after` below it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if self.worry_after >= self.late_after {
            return Err(ConfigError::WorryNotBeforeLate {
                worry: self.worry_after,
                late: self.late_after,
            });
        }
        if self.late_after <= self.tick_interval {
            return Err(ConfigError::LateWithinTick {
                late: self.late_after,
                tick: self.tick_interval,
            });
        }
        Ok(())
    }

    pub fn codec(&self) -> CommandCodec {
        CommandCodec::new(self.byte_order, self.max_payload)
    }
}

/// Serialize a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serialize an `Option<Duration>` as milliseconds or null
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
