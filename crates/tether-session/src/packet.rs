//! Outbound packets and decoded inbound messages

use crate::error::SessionError;
use crate::Role;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tether_proto::{Command, Delivery, MessageCodec, StructuredMessage};
use tokio::time::Instant;

/// An application message waiting to be carried to the peer
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub delivery: Delivery,
    pub message: StructuredMessage,
    pub enqueued_at: Instant,
}

impl Packet {
    pub fn new(delivery: Delivery, message: StructuredMessage) -> Self {
        Self {
            delivery,
            message,
            enqueued_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    /// Wire command for this packet
    pub fn to_command(&self) -> Result<Command, SessionError> {
        let token = MessageCodec::encode(&self.message)?;
        Ok(Command::new(self.delivery.opcode(), token.into_bytes()))
    }
}

/// A message received from the peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub role: Role,
    pub delivery: Delivery,
    pub message: StructuredMessage,
    pub received_at: DateTime<Utc>,
}

impl Inbound {
    pub fn decode(role: Role, cmd: &Command) -> Result<Self, SessionError> {
        let delivery =
            Delivery::from_opcode(cmd.kind).ok_or(SessionError::UnknownDelivery(cmd.kind))?;
        let token = String::from_utf8(cmd.payload.to_vec())?;
        let message = MessageCodec::decode(&token)?;

        Ok(Self {
            role,
            delivery,
            message,
            received_at: Utc::now(),
        })
    }
}
