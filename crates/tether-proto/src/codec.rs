//! Codec for encoding/decoding commands
//!
//! Wire format:
//!
//! ```text
//! +--------------+---------------------------+-------------------+
//! | type (1 byte)| length (4 bytes, u32)     | payload           |
//! |              | in the channel byte order | (length bytes)    |
//! +--------------+---------------------------+-------------------+
//! ```
//!
//! `PING` frames are the type byte alone.

use crate::command::{ByteOrder, Command, PING};
use crate::{DEFAULT_MAX_PAYLOAD, LENGTH_PREFIX_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Ping command cannot carry a payload")]
    PingWithPayload,

    #[error("Stream closed mid-frame ({0} bytes left over)")]
    Truncated(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command codec, configured once per channel
#[derive(Debug, Clone, Copy)]
pub struct CommandCodec {
    order: ByteOrder,
    max_payload: usize,
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new(ByteOrder::Big, DEFAULT_MAX_PAYLOAD)
    }
}

impl CommandCodec {
    pub fn new(order: ByteOrder, max_payload: usize) -> Self {
        Self { order, max_payload }
    }

    /// Encode a command into a standalone frame
    pub fn encode_frame(&self, cmd: &Command) -> Result<Bytes, CommandError> {
        let mut buf = BytesMut::with_capacity(1 + LENGTH_PREFIX_SIZE + cmd.payload.len());
        self.write_frame(cmd, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one command from the front of `buf`
    ///
    /// Returns Ok(Some(command)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err if the frame can never be valid
    pub fn decode_frame(&self, buf: &mut BytesMut) -> Result<Option<Command>, CommandError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let kind = buf[0];
        if !Command::requires_payload(kind) {
            buf.advance(1);
            return Ok(Some(Command::empty(kind)));
        }

        if buf.len() < 1 + LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&buf[1..1 + LENGTH_PREFIX_SIZE]);
        let length = self.order.read_u32(length_bytes) as usize;

        if length > self.max_payload {
            return Err(CommandError::PayloadTooLarge {
                size: length,
                max: self.max_payload,
            });
        }

        if buf.len() < 1 + LENGTH_PREFIX_SIZE + length {
            buf.reserve(1 + LENGTH_PREFIX_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(1 + LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Command { kind, payload }))
    }

    fn write_frame(&self, cmd: &Command, dst: &mut BytesMut) -> Result<(), CommandError> {
        if cmd.kind == PING {
            if !cmd.payload.is_empty() {
                return Err(CommandError::PingWithPayload);
            }
            dst.put_u8(PING);
            return Ok(());
        }

        let payload_len = cmd.payload.len();
        if payload_len > self.max_payload {
            return Err(CommandError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        dst.reserve(1 + LENGTH_PREFIX_SIZE + payload_len);
        dst.put_u8(cmd.kind);
        dst.put_slice(&self.order.write_u32(payload_len as u32));
        dst.put_slice(&cmd.payload);
        Ok(())
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = CommandError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_frame(src)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode_frame(buf)? {
            Some(cmd) => Ok(Some(cmd)),
            None if buf.is_empty() => Ok(None),
            None => Err(CommandError::Truncated(buf.len())),
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = CommandError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.write_frame(&item, dst)
    }
}
