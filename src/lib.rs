//! # mup1-client
//!
//! Async host-side client for switches managed over a serial line with the
//! MUP1 framing protocol and CoAP/CORECONF.
//!
//! ## Layers
//!
//! - **Framing** ([`protocol`]): `>` TYPE payload `<` checksum envelopes,
//!   byte escaping and stream reassembly with resynchronisation
//! - **Messages** ([`coap`]): RFC 7252 CoAP build and parse, CBOR payloads
//! - **Correlation** ([`correlator`]): message IDs, deadlines, exactly-once
//!   settlement
//! - **Connection** ([`Client`]): one event loop per link, pipelined requests
//!   with an in-flight limit
//! - **Captures** ([`capture`]): extract and replay serial traffic recorded
//!   with `strace`
//!
//! ## Example
//!
//! ```ignore
//! use mup1_client::{Client, SerialConfig};
//!
//! #[tokio::main]
//! async fn main() -> mup1_client::Result<()> {
//!     let client = Client::open_serial(&SerialConfig::new("/dev/ttyACM0", 115_200))?;
//!
//!     let interfaces = client.get("/ietf-interfaces:interfaces").await?;
//!     if let Some(payload) = interfaces {
//!         println!("{}", payload.to_json());
//!     }
//!     Ok(())
//! }
//! ```

pub mod backpressure;
pub mod capture;
pub mod coap;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod writer;

mod client;

pub use client::{Client, ClientBuilder, PendingResponse};
pub use coap::{ContentFormat, Method, Payload, ResponseCode};
pub use config::ClientConfig;
pub use correlator::{Request, Response};
pub use error::{Mup1Error, Result};
pub use transport::SerialConfig;
