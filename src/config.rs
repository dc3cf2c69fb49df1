//! Client configuration.
//!
//! Settings can be built in code through [`ClientBuilder`](crate::ClientBuilder)
//! or loaded from JSON:
//!
//! ```
//! use mup1_client::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{ "request_timeout_ms": 2000, "max_in_flight": 16 }"#).unwrap();
//! assert_eq!(config.max_in_flight, 16);
//! assert_eq!(config.request_timeout.as_millis(), 2000);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::backpressure::{DEFAULT_MAX_IN_FLIGHT, MAX_IN_FLIGHT_CEILING};
use crate::error::{Mup1Error, Result};
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::writer::WriterConfig;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default size of a single transport read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024;

/// Settings for one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Deadline for requests that do not set their own.
    pub request_timeout: Duration,
    /// Requests allowed to await a response at once.
    pub max_in_flight: usize,
    /// How long a new request waits for an in-flight slot.
    pub backpressure_timeout: Duration,
    /// Largest accepted frame on the wire.
    pub max_frame_size: usize,
    /// Size of a single transport read.
    pub read_buffer_size: usize,
    /// First message ID to allocate. Derived from the clock when unset, so a
    /// restarted host does not replay IDs the device may still remember.
    pub initial_message_id: Option<u16>,
    pub writer: WriterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            backpressure_timeout: crate::backpressure::DEFAULT_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            initial_message_id: None,
            writer: WriterConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 || self.max_in_flight > MAX_IN_FLIGHT_CEILING {
            return Err(Mup1Error::Config(format!(
                "max_in_flight must be in 1..={} (got {})",
                MAX_IN_FLIGHT_CEILING, self.max_in_flight
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(Mup1Error::Config("request_timeout must be positive".into()));
        }
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(Mup1Error::Config(format!(
                "max_frame_size must be at least {} (got {})",
                MIN_FRAME_SIZE, self.max_frame_size
            )));
        }
        if self.read_buffer_size == 0 || self.writer.channel_capacity == 0 {
            return Err(Mup1Error::Config(
                "read_buffer_size and channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Load settings from JSON. Durations are in milliseconds; missing fields
    /// keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawClientConfig = serde_json::from_str(json)?;
        let config = Self::from(raw);
        config.validate()?;
        Ok(config)
    }

    /// Message ID to start from.
    pub(crate) fn first_message_id(&self) -> u16 {
        self.initial_message_id.unwrap_or_else(clock_message_id)
    }
}

/// Pseudo-random ID in [1, 65535] from the system clock and process ID.
fn clock_message_id() -> u16 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mixed = nanos.wrapping_mul(0x517cc1b727220a95) ^ std::process::id() as u64;
    ((mixed >> 48) as u16).max(1)
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawClientConfig {
    request_timeout_ms: u64,
    max_in_flight: usize,
    backpressure_timeout_ms: u64,
    max_frame_size: usize,
    read_buffer_size: usize,
    initial_message_id: Option<u16>,
    channel_capacity: usize,
    send_timeout_ms: u64,
}

impl Default for RawClientConfig {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            request_timeout_ms: defaults.request_timeout.as_millis() as u64,
            max_in_flight: defaults.max_in_flight,
            backpressure_timeout_ms: defaults.backpressure_timeout.as_millis() as u64,
            max_frame_size: defaults.max_frame_size,
            read_buffer_size: defaults.read_buffer_size,
            initial_message_id: defaults.initial_message_id,
            channel_capacity: defaults.writer.channel_capacity,
            send_timeout_ms: defaults.writer.send_timeout.as_millis() as u64,
        }
    }
}

impl From<RawClientConfig> for ClientConfig {
    fn from(raw: RawClientConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(raw.request_timeout_ms),
            max_in_flight: raw.max_in_flight,
            backpressure_timeout: Duration::from_millis(raw.backpressure_timeout_ms),
            max_frame_size: raw.max_frame_size,
            read_buffer_size: raw.read_buffer_size,
            initial_message_id: raw.initial_message_id,
            writer: WriterConfig {
                channel_capacity: raw.channel_capacity,
                send_timeout: Duration::from_millis(raw.send_timeout_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_in_flight, 64);
        assert_eq!(config.max_frame_size, 64 * 1024);
        assert_eq!(config.read_buffer_size, 4 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_empty_is_default() {
        assert_eq!(ClientConfig::from_json("{}").unwrap(), ClientConfig::default());
    }

    #[test]
    fn test_from_json_overrides() {
        let config = ClientConfig::from_json(
            r#"{ "request_timeout_ms": 250, "backpressure_timeout_ms": 100,
                 "initial_message_id": 4660, "channel_capacity": 8 }"#,
        )
        .unwrap();
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.backpressure_timeout, Duration::from_millis(100));
        assert_eq!(config.first_message_id(), 0x1234);
        assert_eq!(config.writer.channel_capacity, 8);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        for json in [
            r#"{ "max_in_flight": 0 }"#,
            r#"{ "max_in_flight": 5000 }"#,
            r#"{ "request_timeout_ms": 0 }"#,
            r#"{ "max_frame_size": 3 }"#,
        ] {
            assert!(
                matches!(ClientConfig::from_json(json), Err(Mup1Error::Config(_))),
                "{}",
                json
            );
        }
        assert!(matches!(
            ClientConfig::from_json(r#"{ "timeout": 1 }"#),
            Err(Mup1Error::Json(_))
        ));
    }

    #[test]
    fn test_clock_message_id_is_nonzero() {
        assert_ne!(clock_message_id(), 0);
    }
}
