//! CoAP message build and parse.
//!
//! ```text
//!  0                   1                   2                   3
//! ┌───┬───┬───────┬───────────────┬───────────────────────────────┐
//! │Ver│ T │  TKL  │     Code      │          Message ID           │
//! ├───┴───┴───────┴───────────────┴───────────────────────────────┤
//! │ Token (TKL bytes) │ Options ... │ 0xFF │ Payload ...           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use mup1_client::coap::{build, CoapMessage, Method};
//!
//! let bytes = build(Method::Get, 0x1234, "/ietf-interfaces:interfaces", None).unwrap();
//! let message = CoapMessage::parse(&bytes).unwrap();
//!
//! assert_eq!(message.method(), Some(Method::Get));
//! assert_eq!(message.uri_path(), vec!["ietf-interfaces:interfaces"]);
//! assert!(message.payload.is_none());
//! ```

use bytes::Bytes;

use super::code::{Method, ResponseCode};
use super::option::{decode_options, encode_options, number, CoapOption};
use super::{CoapError, Payload, PAYLOAD_MARKER};
use crate::error::Result;

/// Only CoAP version in existence.
pub const VERSION: u8 = 1;

const HEADER_SIZE: usize = 4;
const MAX_TOKEN_LEN: u8 = 8;

/// Message type (header bits 2-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Content-Format identifiers (IANA CoAP registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentFormat {
    /// `application/cbor`
    Cbor,
    /// `application/yang-data+cbor; id=sid`
    YangDataCbor,
    /// `application/yang-identifiers+cbor-seq`
    YangIdentifiersCborSeq,
    /// `application/yang-instances+cbor-seq`
    YangInstancesCborSeq,
    Other(u16),
}

impl ContentFormat {
    pub fn id(self) -> u16 {
        match self {
            ContentFormat::Cbor => 60,
            ContentFormat::YangDataCbor => 140,
            ContentFormat::YangIdentifiersCborSeq => 141,
            ContentFormat::YangInstancesCborSeq => 142,
            ContentFormat::Other(id) => id,
        }
    }

    pub fn from_id(id: u16) -> Self {
        match id {
            60 => ContentFormat::Cbor,
            140 => ContentFormat::YangDataCbor,
            141 => ContentFormat::YangIdentifiersCborSeq,
            142 => ContentFormat::YangInstancesCborSeq,
            other => ContentFormat::Other(other),
        }
    }
}

/// A CoAP message.
#[derive(Debug, Clone, PartialEq)]
pub struct CoapMessage {
    pub message_type: MessageType,
    pub code: u8,
    pub message_id: u16,
    pub token: Bytes,
    /// Options in wire order.
    pub options: Vec<CoapOption>,
    pub payload: Option<Payload>,
}

impl CoapMessage {
    /// Confirmable request without token for `uri`.
    ///
    /// The path is split on `/` into Uri-Path options, empty segments are
    /// skipped. Anything after `?` is split on `&` into Uri-Query options.
    pub fn request(method: Method, message_id: u16, uri: &str) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };

        let mut options: Vec<CoapOption> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| CoapOption::new(number::URI_PATH, Bytes::copy_from_slice(segment.as_bytes())))
            .collect();

        if let Some(query) = query {
            options.extend(
                query
                    .split('&')
                    .filter(|arg| !arg.is_empty())
                    .map(|arg| CoapOption::new(number::URI_QUERY, Bytes::copy_from_slice(arg.as_bytes()))),
            );
        }

        Self {
            message_type: MessageType::Confirmable,
            code: method.code(),
            message_id,
            token: Bytes::new(),
            options,
            payload: None,
        }
    }

    /// Attach a payload and its Content-Format.
    pub fn with_payload(mut self, payload: Payload, format: ContentFormat) -> Self {
        self.set_option(CoapOption::uint(number::CONTENT_FORMAT, format.id() as u32));
        self.payload = Some(payload);
        self
    }

    /// Ask the device for a specific Content-Format.
    pub fn with_accept(mut self, format: ContentFormat) -> Self {
        self.set_option(CoapOption::uint(number::ACCEPT, format.id() as u32));
        self
    }

    /// Replace every instance of `option.number` with `option`.
    fn set_option(&mut self, option: CoapOption) {
        self.options.retain(|o| o.number != option.number);
        self.options.push(option);
    }

    /// Encode to wire bytes.
    ///
    /// Options are emitted in ascending number order; repeated options keep
    /// their relative order.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match &self.payload {
            Some(payload) => payload.to_bytes()?,
            None => Bytes::new(),
        };

        let mut options = self.options.clone();
        options.sort_by_key(|o| o.number);

        let token_len = self.token.len().min(MAX_TOKEN_LEN as usize);
        let mut out = Vec::with_capacity(HEADER_SIZE + token_len + 16 + payload.len());
        out.push((VERSION << 6) | ((self.message_type as u8) << 4) | token_len as u8);
        out.push(self.code);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token[..token_len]);

        encode_options(&options, &mut out)?;

        if !payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&payload);
        }

        Ok(out)
    }

    /// Parse wire bytes.
    ///
    /// Options are walked through their own delta/length fields; only the byte
    /// that follows the last option is considered as a payload marker.
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, CoapError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CoapError::TooShort(bytes.len()));
        }

        let version = bytes[0] >> 6;
        if version != VERSION {
            return Err(CoapError::InvalidVersion(version));
        }
        let message_type = MessageType::from_bits(bytes[0] >> 4);
        let token_len = bytes[0] & 0x0F;
        if token_len > MAX_TOKEN_LEN {
            return Err(CoapError::InvalidTokenLength(token_len));
        }
        let code = bytes[1];
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        let mut pos = HEADER_SIZE + token_len as usize;
        let token = bytes
            .get(HEADER_SIZE..pos)
            .ok_or(CoapError::Truncated("token"))?;
        let token = Bytes::copy_from_slice(token);

        let options = decode_options(bytes, &mut pos)?;

        let payload = match bytes.get(pos) {
            Some(&PAYLOAD_MARKER) => {
                let body = &bytes[pos + 1..];
                if body.is_empty() {
                    return Err(CoapError::EmptyPayload);
                }
                Some(Payload::decode(Bytes::copy_from_slice(body)))
            }
            _ => None,
        };

        Ok(Self {
            message_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }

    /// Request method, if the code is a request code.
    pub fn method(&self) -> Option<Method> {
        Method::from_code(self.code)
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode(self.code)
    }

    /// Values of all options with `number`, in order.
    pub fn options(&self, number: u16) -> impl Iterator<Item = &CoapOption> {
        self.options.iter().filter(move |o| o.number == number)
    }

    /// Uri-Path segments.
    pub fn uri_path(&self) -> Vec<String> {
        self.options(number::URI_PATH)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
            .collect()
    }

    /// Uri-Query arguments.
    pub fn uri_query(&self) -> Vec<String> {
        self.options(number::URI_QUERY)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
            .collect()
    }

    /// Reassembled `/path?query` form.
    pub fn uri(&self) -> String {
        let mut uri = String::new();
        for segment in self.uri_path() {
            uri.push('/');
            uri.push_str(&segment);
        }
        if uri.is_empty() {
            uri.push('/');
        }
        let query = self.uri_query();
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query.join("&"));
        }
        uri
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.options(number::CONTENT_FORMAT)
            .next()
            .and_then(CoapOption::as_uint)
            .map(|id| ContentFormat::from_id(id as u16))
    }
}

/// Build a Confirmable request.
///
/// A payload is tagged `application/cbor`.
pub fn build(method: Method, message_id: u16, uri: &str, payload: Option<Payload>) -> Result<Vec<u8>> {
    let mut message = CoapMessage::request(method, message_id, uri);
    if let Some(payload) = payload {
        message = message.with_payload(payload, ContentFormat::Cbor);
    }
    message.encode()
}
