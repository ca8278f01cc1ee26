//! Structured message token codec
//!
//! A structured message is an address plus typed named fields. It travels as a
//! single string token:
//!
//! ```text
//! <address>#s.<key>=<value>&i.<key>=<decimal>&...
//! ```
//!
//! The field section is form-urlencoded, so it never contains a raw `#` and
//! the token always splits on its last `#`. Only strings and integers are
//! embedded directly. Binary and list fields are pre-encoded into base64
//! strings under a reserved key prefix and restored on decode.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;
use url::form_urlencoded;

/// Key prefix for pre-encoded binary fields
pub const BINARY_PREFIX: &str = "~bin~";
/// Key prefix for pre-encoded string lists
pub const STRING_LIST_PREFIX: &str = "~strs~";
/// Key prefix for pre-encoded integer lists
pub const INTEGER_LIST_PREFIX: &str = "~ints~";

const RESERVED_PREFIXES: [&str; 3] = [BINARY_PREFIX, STRING_LIST_PREFIX, INTEGER_LIST_PREFIX];

const STRING_TAG: &str = "s.";
const INTEGER_TAG: &str = "i.";
const FIELD_SEPARATOR: char = '#';

/// Structured message codec errors
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Token has no field separator")]
    MissingSeparator,

    #[error("Field key uses a reserved prefix: {0}")]
    ReservedKey(String),

    #[error("Field {0} must be pre-encoded before embedding")]
    UnencodedField(String),

    #[error("Field {0} has an unknown type tag")]
    UnknownTag(String),

    #[error("Invalid integer in field {key}: {value}")]
    InvalidInteger { key: String, value: String },

    #[error("Invalid base64 in field {key}: {source}")]
    Base64 {
        key: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Invalid list encoding in field {key}: {source}")]
    List {
        key: String,
        #[source]
        source: bincode::Error,
    },

    #[error("Reserved field {0} does not hold a string")]
    NotAString(String),
}

/// Typed field value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    String(String),
    Integer(i64),
    StringList(Vec<String>),
    IntegerList(Vec<i64>),
    Binary(Vec<u8>),
}

/// An application message: an address and typed named fields
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StructuredMessage {
    pub address: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl StructuredMessage {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_field(key, FieldValue::String(value.into()))
    }

    pub fn with_integer(self, key: impl Into<String>, value: i64) -> Self {
        self.with_field(key, FieldValue::Integer(value))
    }

    pub fn with_binary(self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.with_field(key, FieldValue::Binary(value.into()))
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }
}

/// Structured message codec
pub struct MessageCodec;

impl MessageCodec {
    /// Encode a message into a single string-safe token
    pub fn encode(msg: &StructuredMessage) -> Result<String, MessageError> {
        let flat = Self::pre_encode(msg)?;
        Self::to_token(&flat)
    }

    /// Decode a token back into a message
    ///
    /// Fields that fail to decode are logged and skipped; only a token without
    /// a field section fails as a whole.
    pub fn decode(token: &str) -> Result<StructuredMessage, MessageError> {
        let flat = Self::from_token(token)?;
        Ok(Self::post_decode(flat))
    }

    /// Rewrite binary and list fields into reserved-prefix string fields
    pub fn pre_encode(msg: &StructuredMessage) -> Result<StructuredMessage, MessageError> {
        let mut fields = BTreeMap::new();

        for (key, value) in &msg.fields {
            if RESERVED_PREFIXES.iter().any(|p| key.starts_with(p)) {
                return Err(MessageError::ReservedKey(key.clone()));
            }

            let (key, value) = match value {
                FieldValue::String(_) | FieldValue::Integer(_) => (key.clone(), value.clone()),
                FieldValue::Binary(bytes) => (
                    format!("{BINARY_PREFIX}{key}"),
                    FieldValue::String(STANDARD.encode(bytes)),
                ),
                FieldValue::StringList(list) => {
                    let bytes = bincode::serialize(list).map_err(|source| MessageError::List {
                        key: key.clone(),
                        source,
                    })?;
                    (
                        format!("{STRING_LIST_PREFIX}{key}"),
                        FieldValue::String(STANDARD.encode(bytes)),
                    )
                }
                FieldValue::IntegerList(list) => {
                    let bytes = bincode::serialize(list).map_err(|source| MessageError::List {
                        key: key.clone(),
                        source,
                    })?;
                    (
                        format!("{INTEGER_LIST_PREFIX}{key}"),
                        FieldValue::String(STANDARD.encode(bytes)),
                    )
                }
            };
            fields.insert(key, value);
        }

        Ok(StructuredMessage {
            address: msg.address.clone(),
            fields,
        })
    }

    /// Restore reserved-prefix fields to their original keys and types
    pub fn post_decode(msg: StructuredMessage) -> StructuredMessage {
        let mut fields = BTreeMap::new();

        for (key, value) in msg.fields {
            match Self::restore_field(&key, value) {
                Ok((key, value)) => {
                    fields.insert(key, value);
                }
                Err(e) => warn!(field = %key, "Skipping undecodable field: {}", e),
            }
        }

        StructuredMessage {
            address: msg.address,
            fields,
        }
    }

    fn restore_field(key: &str, value: FieldValue) -> Result<(String, FieldValue), MessageError> {
        let Some(prefix) = RESERVED_PREFIXES.iter().find(|p| key.starts_with(**p)) else {
            return Ok((key.to_string(), value));
        };

        let FieldValue::String(encoded) = value else {
            return Err(MessageError::NotAString(key.to_string()));
        };

        let original = key[prefix.len()..].to_string();
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|source| MessageError::Base64 {
                key: key.to_string(),
                source,
            })?;

        let restored = match *prefix {
            BINARY_PREFIX => FieldValue::Binary(bytes),
            STRING_LIST_PREFIX => {
                FieldValue::StringList(bincode::deserialize(&bytes).map_err(|source| {
                    MessageError::List {
                        key: key.to_string(),
                        source,
                    }
                })?)
            }
            _ => FieldValue::IntegerList(bincode::deserialize(&bytes).map_err(|source| {
                MessageError::List {
                    key: key.to_string(),
                    source,
                }
            })?),
        };

        Ok((original, restored))
    }

    /// Embed an already pre-encoded message into a token
    pub fn to_token(msg: &StructuredMessage) -> Result<String, MessageError> {
        let mut query = form_urlencoded::Serializer::new(String::new());

        for (key, value) in &msg.fields {
            match value {
                FieldValue::String(s) => {
                    query.append_pair(&format!("{STRING_TAG}{key}"), s);
                }
                FieldValue::Integer(i) => {
                    query.append_pair(&format!("{INTEGER_TAG}{key}"), &i.to_string());
                }
                _ => return Err(MessageError::UnencodedField(key.clone())),
            }
        }

        Ok(format!("{}{}{}", msg.address, FIELD_SEPARATOR, query.finish()))
    }

    /// Parse a token into a message holding only string and integer fields
    pub fn from_token(token: &str) -> Result<StructuredMessage, MessageError> {
        let (address, query) = token
            .rsplit_once(FIELD_SEPARATOR)
            .ok_or(MessageError::MissingSeparator)?;

        let mut fields = BTreeMap::new();
        for (tagged, value) in form_urlencoded::parse(query.as_bytes()) {
            match Self::parse_scalar(&tagged, &value) {
                Ok((key, value)) => {
                    fields.insert(key, value);
                }
                Err(e) => warn!(field = %tagged, "Skipping undecodable field: {}", e),
            }
        }

        Ok(StructuredMessage {
            address: address.to_string(),
            fields,
        })
    }

    fn parse_scalar(tagged: &str, value: &str) -> Result<(String, FieldValue), MessageError> {
        if let Some(key) = tagged.strip_prefix(STRING_TAG) {
            return Ok((key.to_string(), FieldValue::String(value.to_string())));
        }

        if let Some(key) = tagged.strip_prefix(INTEGER_TAG) {
            let parsed = value
                .parse::<i64>()
                .map_err(|_| MessageError::InvalidInteger {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            return Ok((key.to_string(), FieldValue::Integer(parsed)));
        }

        Err(MessageError::UnknownTag(tagged.to_string()))
    }
}
