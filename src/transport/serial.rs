//! Serial port transport.
//!
//! # Example
//!
//! ```ignore
//! use mup1_client::transport::{open_serial, SerialConfig};
//!
//! let port = open_serial(&SerialConfig::new("/dev/ttyACM0", 115_200))?;
//! ```

use serde::Deserialize;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::{Mup1Error, Result};

/// Baud rate used by VelocityDRIVE-class devices.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial line settings. Defaults to 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }

    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Load settings from JSON.
    ///
    /// ```json
    /// { "path": "/dev/ttyACM0", "baud_rate": 115200, "parity": "none" }
    /// ```
    ///
    /// Only `path` is required.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawSerialConfig = serde_json::from_str(json)?;
        raw.try_into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSerialConfig {
    path: String,
    #[serde(default = "default_baud_rate")]
    baud_rate: u32,
    #[serde(default = "default_data_bits")]
    data_bits: u8,
    #[serde(default = "default_none")]
    parity: String,
    #[serde(default = "default_stop_bits")]
    stop_bits: u8,
    #[serde(default = "default_none")]
    flow_control: String,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_none() -> String {
    "none".to_string()
}

impl TryFrom<RawSerialConfig> for SerialConfig {
    type Error = Mup1Error;

    fn try_from(raw: RawSerialConfig) -> Result<Self> {
        let data_bits = match raw.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(Mup1Error::Config(format!(
                    "data_bits must be one of 5, 6, 7, 8 (got {})",
                    other
                )))
            }
        };
        let parity = match raw.parity.trim().to_ascii_lowercase().as_str() {
            "none" => Parity::None,
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            _ => {
                return Err(Mup1Error::Config(format!(
                    "parity must be one of none, even, odd (got {})",
                    raw.parity
                )))
            }
        };
        let stop_bits = match raw.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(Mup1Error::Config(format!(
                    "stop_bits must be 1 or 2 (got {})",
                    other
                )))
            }
        };
        let flow_control = match raw.flow_control.trim().to_ascii_lowercase().as_str() {
            "none" => FlowControl::None,
            "software" => FlowControl::Software,
            "hardware" => FlowControl::Hardware,
            _ => {
                return Err(Mup1Error::Config(format!(
                    "flow_control must be one of none, software, hardware (got {})",
                    raw.flow_control
                )))
            }
        };

        Ok(SerialConfig {
            path: raw.path,
            baud_rate: raw.baud_rate,
            data_bits,
            parity,
            stop_bits,
            flow_control,
        })
    }
}

/// Open and configure a serial port.
pub fn open_serial(config: &SerialConfig) -> Result<SerialStream> {
    let stream = tokio_serial::new(config.path.clone(), config.baud_rate)
        .data_bits(config.data_bits)
        .parity(config.parity)
        .stop_bits(config.stop_bits)
        .flow_control(config.flow_control)
        .open_native_async()?;

    tracing::info!(
        "opened {} at {} baud ({:?}, {:?}, {:?}, {:?})",
        config.path,
        config.baud_rate,
        config.data_bits,
        config.parity,
        config.stop_bits,
        config.flow_control
    );
    Ok(stream)
}
