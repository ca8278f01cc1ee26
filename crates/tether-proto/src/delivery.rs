//! Application delivery kinds and their command opcodes

use serde::{Deserialize, Serialize};

/// How the receiving side should hand a structured message to its application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Delivery {
    /// Fan the message out to every interested listener
    Broadcast = 100,
    /// Start the service the message is addressed to
    StartService = 101,
}

impl Delivery {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            100 => Some(Delivery::Broadcast),
            101 => Some(Delivery::StartService),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes() {
        assert_eq!(Delivery::Broadcast.opcode(), 100);
        assert_eq!(Delivery::StartService.opcode(), 101);
        assert_eq!(Delivery::from_opcode(100), Some(Delivery::Broadcast));
        assert_eq!(Delivery::from_opcode(101), Some(Delivery::StartService));
        assert_eq!(Delivery::from_opcode(crate::PING), None);
        assert_eq!(Delivery::from_opcode(0), None);
    }
}
