//! Parsing of outbound messages typed on stdin
//!
//! One message per line: `[!]<address> key=value ...`. A leading `!` sends
//! the message as a service start instead of a broadcast. Values that parse
//! as integers become integer fields, everything else a string field.

use anyhow::{bail, Result};
use tether_proto::{Delivery, StructuredMessage};

/// Parse one line; blank lines and `#` comments yield `None`
pub fn parse_line(line: &str) -> Result<Option<(Delivery, StructuredMessage)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let head = parts.next().unwrap_or_default();
    let (delivery, address) = match head.strip_prefix('!') {
        Some(rest) => (Delivery::StartService, rest),
        None => (Delivery::Broadcast, head),
    };
    if address.is_empty() {
        bail!("Missing message address");
    }

    let mut message = StructuredMessage::new(address);
    for part in parts {
        let Some((key, value)) = part.split_once('=') else {
            bail!("Expected key=value, got {:?}", part);
        };
        if key.is_empty() {
            bail!("Empty field name in {:?}", part);
        }

        message = match value.parse::<i64>() {
            Ok(n) => message.with_integer(key, n),
            Err(_) => message.with_string(key, value),
        };
    }

    Ok(Some((delivery, message)))
}
