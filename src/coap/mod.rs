//! CoAP message codec (RFC 7252 subset).
//!
//! Requests are always Confirmable and carry no token; the message ID is the
//! only correlation key. Options supported on build: Uri-Path, Content-Format,
//! Uri-Query and Accept. Parsing accepts any option numbers.

mod code;
mod message;
mod option;

pub use code::{Method, ResponseCode};
pub use message::{build, CoapMessage, ContentFormat, MessageType};
pub use option::{number, CoapOption, OptionNibble, MAX_OPTION_FIELD};

use bytes::Bytes;
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::codec::{self, CborCodec};
use crate::error::Result;

/// Byte separating options from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Malformed CoAP message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoapError {
    #[error("message too short ({0} bytes)")]
    TooShort(usize),

    #[error("unsupported CoAP version {0}")]
    InvalidVersion(u8),

    #[error("token length {0} exceeds 8")]
    InvalidTokenLength(u8),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("reserved option nibble 15")]
    ReservedNibble,

    #[error("option number exceeds 65535")]
    OptionNumberOverflow,

    #[error("option delta or length {0} exceeds 65804")]
    OptionTooLarge(usize),

    #[error("payload marker followed by empty payload")]
    EmptyPayload,
}

/// Message body.
///
/// Received payloads are CBOR-decoded when possible; bytes that do not form a
/// single CBOR item are kept raw.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Cbor(Value),
    Raw(Bytes),
}

impl Payload {
    /// Serialize any serde value into a CBOR payload.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Payload::Cbor(CborCodec::to_value(value)?))
    }

    /// Interpret received bytes.
    pub fn decode(bytes: Bytes) -> Self {
        match CborCodec::decode_value(&bytes) {
            Ok(value) => Payload::Cbor(value),
            Err(e) => {
                tracing::trace!("payload is not CBOR ({}), keeping {} raw bytes", e, bytes.len());
                Payload::Raw(bytes)
            }
        }
    }

    /// Wire bytes of this payload.
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Payload::Cbor(value) => Ok(Bytes::from(CborCodec::encode(value)?)),
            Payload::Raw(bytes) => Ok(bytes.clone()),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Cbor(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    /// Deserialize into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Payload::Cbor(value) => Ok(value.deserialized()?),
            Payload::Raw(bytes) => CborCodec::decode(bytes),
        }
    }

    /// JSON projection for consumers outside the CBOR world.
    ///
    /// Raw payloads become a lowercase hex string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Payload::Cbor(value) => codec::to_json(value),
            Payload::Raw(bytes) => serde_json::Value::String(hex::encode(bytes)),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Cbor(value)
    }
}
