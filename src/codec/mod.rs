//! Codec module - CBOR payload serialization.
//!
//! - [`CborCodec`] - CBOR using `ciborium`
//! - [`to_json`] - JSON projection of decoded values for callers that speak JSON
//!
//! # Design
//!
//! The codec is a marker struct with static methods rather than a trait
//! object; there is exactly one payload encoding on this link.

mod cbor;

pub use cbor::{to_json, CborCodec};
