//! Transport module - the byte stream under the framing layer.
//!
//! The client works over any full-duplex async byte stream:
//! - Serial ports through `tokio-serial` ([`open_serial`])
//! - Anything else implementing [`Transport`] (TCP bridges, test pipes)

mod serial;

pub use serial::{open_serial, SerialConfig, DEFAULT_BAUD_RATE};

use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream the client can own.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
