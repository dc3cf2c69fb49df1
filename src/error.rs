//! Error types for mup1-client.

use std::time::Duration;

use thiserror::Error;

use crate::coap::{CoapError, Payload, ResponseCode};
use crate::protocol::FrameError;

/// Main error type for all mup1-client operations.
#[derive(Debug, Error)]
pub enum Mup1Error {
    /// I/O error on the serial port or stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or configured.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// CBOR serialization error.
    #[error("CBOR encode error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    /// CBOR deserialization error.
    #[error("CBOR decode error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    /// Conversion between a CBOR value and a Rust type failed.
    #[error("CBOR value error: {0}")]
    CborValue(#[from] ciborium::value::Error),

    /// JSON error (configuration files only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MUP1 framing error (incomplete or corrupted frame).
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Malformed CoAP message.
    #[error("CoAP error: {0}")]
    Coap(#[from] CoapError),

    /// No response arrived before the request deadline.
    #[error("request {message_id} timed out after {after:?}")]
    Timeout {
        /// Message ID of the expired request.
        message_id: u16,
        /// Configured timeout.
        after: Duration,
    },

    /// The device answered with a non-success response class.
    #[error("device returned {code}")]
    DeviceError {
        /// CoAP response code.
        code: ResponseCode,
        /// Diagnostic payload, if the device sent one.
        payload: Option<Payload>,
    },

    /// The device rejected the message with a CoAP Reset.
    #[error("device reset request {message_id}")]
    Reset {
        /// Message ID of the rejected request.
        message_id: u16,
    },

    /// A successful response carried no payload where one was expected.
    #[error("response to request {message_id} has no payload")]
    MissingPayload {
        /// Message ID of the answered request.
        message_id: u16,
    },

    /// The request was cancelled before a response arrived.
    #[error("request {message_id} cancelled")]
    Cancelled {
        /// Message ID of the cancelled request.
        message_id: u16,
    },

    /// The transport failed while the request was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The client has been closed or its event loop has stopped.
    #[error("connection closed")]
    ConnectionClosed,

    /// In-flight limit did not free up within the backpressure timeout.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// Every usable message ID is held by a pending request.
    #[error("too many outstanding requests ({0})")]
    TooManyOutstanding(usize),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A captured serial log could not be parsed.
    #[error("capture parse error: {0}")]
    Capture(String),
}

impl Mup1Error {
    /// Returns the CoAP response code for device errors.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Mup1Error::DeviceError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for errors that end the connection rather than a single request.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Mup1Error::Io(_)
                | Mup1Error::Serial(_)
                | Mup1Error::ConnectionLost(_)
                | Mup1Error::ConnectionClosed
        )
    }
}

/// Result type alias using Mup1Error.
pub type Result<T> = std::result::Result<T, Mup1Error>;
