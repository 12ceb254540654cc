//! Transport module: device command plumbing for both probe variants
//!
//! A transport owns the byte sink towards the device (anything that is
//! [`std::io::Write`]). Device variants differ in wire protocol and in
//! what they can do; the latter is declared up front as [`Capabilities`].
//!
//! # Example
//! ```ignore
//! let mut transport = SerialTransport::new(port);
//! transport.send_command(&[command::GET_METADATA])?;
//! let meta = transport.parse_meta(&reply)?;
//! let decoder = transport.decoder(&config);
//! transport.start()?;
//! ```

pub mod rtt;
pub mod serial;

pub use rtt::RttTransport;
pub use serial::SerialTransport;

use thiserror::Error;

use crate::config::Config;
use crate::decoder::{Decoder, Modifiers};

/// Device command codes
pub mod command {
    pub const TRIGGER_SET: u8 = 0x01;
    pub const AVG_NUM_SET: u8 = 0x02;
    pub const TRIGGER_WINDOW_SET: u8 = 0x03;
    pub const TRIGGER_INTERVAL_SET: u8 = 0x04;
    pub const TRIGGER_SINGLE_SET: u8 = 0x05;
    pub const AVERAGE_START: u8 = 0x06;
    pub const AVERAGE_STOP: u8 = 0x07;
    pub const RANGE_SET: u8 = 0x08;
    pub const TRIGGER_STOP: u8 = 0x0A;
    pub const DEVICE_RUNNING_SET: u8 = 0x0C;
    pub const REGULATOR_SET: u8 = 0x0D;
    pub const RES_USER_SET: u8 = 0x12;
    pub const SPIKE_FILTERING_ON: u8 = 0x15;
    pub const SPIKE_FILTERING_OFF: u8 = 0x16;
    pub const GET_METADATA: u8 = 0x19;
    pub const RESET: u8 = 0x20;
    pub const SET_USER_GAINS: u8 = 0x25;
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid metadata value for {key}: {value}")]
    InvalidMetadata { key: String, value: String },

    #[error("Metadata ended without END marker")]
    IncompleteMetadata,

    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),
}

/// What a device variant can do
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capabilities {
    /// Device gates data delivery itself and marks the end of each burst
    pub hard_trigger: bool,
    /// Trigger windows can be shifted to capture before the trigger point
    pub pre_post_trigger: bool,
    /// Samples carry digital channel bits
    pub digital_channels: bool,
    /// Trigger input pin on the device
    pub external_trigger: bool,
    /// Spike filtering is switched on the device
    pub spike_filter: bool,
    /// Supply voltage can be set
    pub vdd_control: bool,
    /// Nominal sampling period in microseconds
    pub sampling_period_us: f64,
}

/// Device metadata reported on connect
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetadata {
    pub version: Option<String>,
    pub hw: Option<u32>,
    pub mode: Option<u8>,
    pub calibrated: bool,
    pub vdd_mv: Option<u16>,
    pub ia: Option<i64>,
    /// Calibration modifiers, only reported by the serial probe
    pub modifiers: Option<Modifiers>,
}

/// Device transport shared by both probe variants
pub trait Transport {
    /// Static description of the device variant
    fn capabilities(&self) -> Capabilities;

    /// Send one command (code followed by arguments)
    fn send_command(&mut self, command: &[u8]) -> Result<(), TransportError>;

    /// Start streaming samples
    fn start(&mut self) -> Result<(), TransportError>;

    /// Stop streaming samples
    fn stop(&mut self) -> Result<(), TransportError>;

    /// Parse the metadata text reported by the device
    fn parse_meta(&mut self, text: &str) -> Result<DeviceMetadata, TransportError>;

    /// Decoder for the byte stream this device produces
    fn decoder(&self, config: &Config) -> Decoder;

    /// Set the supply voltage in millivolts
    fn set_vdd(&mut self, vdd_mv: u16) -> Result<(), TransportError> {
        if !self.capabilities().vdd_control {
            return Err(TransportError::Unsupported("VDD control"));
        }
        let [hi, lo] = vdd_mv.to_be_bytes();
        self.send_command(&[command::REGULATOR_SET, hi, lo])
    }

    /// Switch the device-side spike filter
    fn set_spike_filtering(&mut self, on: bool) -> Result<(), TransportError> {
        if !self.capabilities().spike_filter {
            return Err(TransportError::Unsupported("device spike filter"));
        }
        let code = if on {
            command::SPIKE_FILTERING_ON
        } else {
            command::SPIKE_FILTERING_OFF
        };
        self.send_command(&[code])
    }

    /// Reset the device
    fn reset(&mut self) -> Result<(), TransportError> {
        self.send_command(&[command::RESET])
    }
}

/// Little-endian bytes of an `f32` command argument
pub fn float_to_le_bytes(value: f32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Big-endian bytes of the low 24 bits of `value`
pub fn u24_be_bytes(value: u32) -> [u8; 3] {
    let [_, a, b, c] = value.to_be_bytes();
    [a, b, c]
}

/// Parse `key: value` lines up to the `END` marker
///
/// Blank lines are skipped. Returns the pairs in order of appearance.
pub fn parse_key_values(text: &str) -> Result<Vec<(String, String)>, TransportError> {
    let mut pairs = Vec::new();
    for line in text.lines().map(str::trim) {
        if line == "END" {
            return Ok(pairs);
        }
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) => pairs.push((key.trim().to_string(), value.trim().to_string())),
            None => {
                return Err(TransportError::InvalidMetadata {
                    key: line.to_string(),
                    value: String::new(),
                })
            }
        }
    }
    Err(TransportError::IncompleteMetadata)
}

/// Parse a metadata value, naming the key on failure
pub(crate) fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, TransportError> {
    value.parse().map_err(|_| TransportError::InvalidMetadata {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u24_be_bytes() {
        assert_eq!(u24_be_bytes(0x0012_3456), [0x12, 0x34, 0x56]);
        assert_eq!(u24_be_bytes(0xFF00_0001), [0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_float_to_le_bytes() {
        assert_eq!(float_to_le_bytes(1.0), [0x00, 0x00, 0x80, 0x3F]);
    }

    #[test]
    fn test_parse_key_values() {
        let pairs = parse_key_values("hw: 12\n\nmode : 2\nEND\nignored: 1").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("hw".to_string(), "12".to_string()),
                ("mode".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_key_values_requires_end() {
        assert!(matches!(
            parse_key_values("hw: 1\n"),
            Err(TransportError::IncompleteMetadata)
        ));
    }

    #[test]
    fn test_parse_key_values_rejects_garbage() {
        assert!(matches!(
            parse_key_values("garbage\nEND"),
            Err(TransportError::InvalidMetadata { .. })
        ));
    }
}
