//! CBOR codec using `ciborium`.
//!
//! Device payloads are YANG-CBOR (RFC 9254): maps keyed by integer SIDs or by
//! names, byte strings for binary leaves. The codec treats them as opaque
//! [`Value`] trees; typed access goes through serde.
//!
//! # Example
//!
//! ```
//! use mup1_client::codec::CborCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Interface {
//!     name: String,
//!     enabled: bool,
//! }
//!
//! let iface = Interface { name: "1".into(), enabled: true };
//! let encoded = CborCodec::encode(&iface).unwrap();
//! let decoded: Interface = CborCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, iface);
//! ```

use ciborium::Value;

use crate::error::Result;

/// CBOR codec for structured payloads.
pub struct CborCodec;

impl CborCodec {
    /// Encode a value to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)?;
        Ok(buf)
    }

    /// Decode CBOR bytes to a value.
    ///
    /// The input must hold exactly one data item.
    ///
    /// # Errors
    ///
    /// Returns `CborDecode` on malformed input, trailing bytes, or a shape that
    /// does not match `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        let mut reader = bytes;
        let value = ciborium::from_reader(&mut reader)?;
        if !reader.is_empty() {
            return Err(ciborium::de::Error::<std::io::Error>::Semantic(
                Some(bytes.len() - reader.len()),
                format!("{} trailing bytes", reader.len()),
            )
            .into());
        }
        Ok(value)
    }

    /// Decode CBOR bytes to a dynamic value tree.
    #[inline]
    pub fn decode_value(bytes: &[u8]) -> Result<Value> {
        Self::decode(bytes)
    }

    /// Convert any serde value into a dynamic value tree.
    #[inline]
    pub fn to_value<T: serde::Serialize + ?Sized>(value: &T) -> Result<Value> {
        Ok(Value::serialized(value)?)
    }
}

/// Project a CBOR value onto JSON.
///
/// Integer map keys (SIDs) become decimal strings, byte strings become
/// lowercase hex, tags are dropped in favour of their content. Integers
/// outside the JSON number range and non-finite floats become strings and
/// `null` respectively.
pub fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => {
            let wide = i128::from(*i);
            if let Ok(n) = i64::try_from(wide) {
                Json::from(n)
            } else if let Ok(n) = u64::try_from(wide) {
                Json::from(n)
            } else {
                Json::String(wide.to_string())
            }
        }
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::String(hex::encode(b)),
        Value::Tag(_, inner) => to_json(inner),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (map_key(k), to_json(v)))
                .collect(),
        ),
        _ => Json::Null,
    }
}

fn map_key(key: &Value) -> String {
    match key {
        Value::Text(s) => s.clone(),
        Value::Integer(i) => i128::from(*i).to_string(),
        Value::Bytes(b) => hex::encode(b),
        other => to_json(other).to_string(),
    }
}
