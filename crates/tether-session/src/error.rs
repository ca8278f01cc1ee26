//! Session errors

use tether_proto::MessageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown delivery opcode: {0}")]
    UnknownDelivery(u8),

    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Message codec error: {0}")]
    Message(#[from] MessageError),
}
