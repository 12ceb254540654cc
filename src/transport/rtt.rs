//! RTT probe transport (escaped-burst wire variant)
//!
//! Commands are sent inside STX/ETX frames with the same escaping as the
//! sample stream. The device implements the trigger itself: samples are
//! only delivered in bursts, and the last sample of each burst is flagged.

use std::io::Write;

use tracing::{debug, info};

use super::{
    command, float_to_le_bytes, parse_key_values, parse_value, u24_be_bytes, Capabilities,
    DeviceMetadata, Transport, TransportError,
};
use crate::config::Config;
use crate::decoder::escaped::encode_frame;
use crate::decoder::{Decoder, EscapedBurstDecoder, EscapedConfig};

const CAPABILITIES: Capabilities = Capabilities {
    hard_trigger: true,
    pre_post_trigger: false,
    digital_channels: false,
    external_trigger: true,
    spike_filter: true,
    vdd_control: true,
    sampling_period_us: 13.0,
};

/// Transport for the RTT probe
#[derive(Debug)]
pub struct RttTransport<W: Write> {
    sink: W,
    running: bool,
}

impl<W: Write> RttTransport<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    /// Arm the device trigger at `level_ua` microamperes
    pub fn set_trigger_level(&mut self, level_ua: u32) -> Result<(), TransportError> {
        let [a, b, c] = u24_be_bytes(level_ua);
        self.send_command(&[command::TRIGGER_SET, a, b, c])
    }

    /// Burst length in microseconds
    pub fn set_trigger_window(&mut self, window_us: u16) -> Result<(), TransportError> {
        let [hi, lo] = window_us.to_be_bytes();
        self.send_command(&[command::TRIGGER_WINDOW_SET, hi, lo])
    }

    /// Minimum time between bursts in microseconds
    pub fn set_trigger_interval(&mut self, interval_us: u16) -> Result<(), TransportError> {
        let [hi, lo] = interval_us.to_be_bytes();
        self.send_command(&[command::TRIGGER_INTERVAL_SET, hi, lo])
    }

    /// Deliver one burst, then stop
    pub fn trigger_single(&mut self) -> Result<(), TransportError> {
        self.send_command(&[command::TRIGGER_SINGLE_SET])
    }

    pub fn trigger_stop(&mut self) -> Result<(), TransportError> {
        self.send_command(&[command::TRIGGER_STOP])
    }

    /// Number of raw conversions per averaged sample
    pub fn set_average_count(&mut self, count: u8) -> Result<(), TransportError> {
        self.send_command(&[command::AVG_NUM_SET, count])
    }

    /// Force a measurement range instead of automatic switching
    pub fn set_range(&mut self, range: u8) -> Result<(), TransportError> {
        self.send_command(&[command::RANGE_SET, range])
    }

    /// Override the shunt resistor values (low, mid, high)
    pub fn set_user_resistors(&mut self, resistors: [f32; 3]) -> Result<(), TransportError> {
        let mut cmd = Vec::with_capacity(1 + 4 * resistors.len());
        cmd.push(command::RES_USER_SET);
        for r in resistors {
            cmd.extend_from_slice(&float_to_le_bytes(r));
        }
        self.send_command(&cmd)
    }
}

impl<W: Write> Transport for RttTransport<W> {
    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    fn send_command(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        debug!(code = cmd.first().copied().unwrap_or_default(), len = cmd.len(), "RTT command");
        self.sink.write_all(&encode_frame(cmd))?;
        self.sink.flush()?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        self.send_command(&[command::AVERAGE_START])?;
        self.running = true;
        info!("RTT probe started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.send_command(&[command::AVERAGE_STOP])?;
        self.running = false;
        info!("RTT probe stopped");
        Ok(())
    }

    fn parse_meta(&mut self, text: &str) -> Result<DeviceMetadata, TransportError> {
        let mut meta = DeviceMetadata::default();
        for (key, value) in parse_key_values(text)? {
            match key.to_ascii_lowercase().as_str() {
                "version" => meta.version = Some(value),
                "board id" | "board_id" => {
                    meta.hw = Some(u32::from_str_radix(value.trim_start_matches("0x"), 16).map_err(
                        |_| TransportError::InvalidMetadata {
                            key: key.clone(),
                            value: value.clone(),
                        },
                    )?)
                }
                "vdd" => meta.vdd_mv = Some(parse_value(&key, &value)?),
                "cal" | "calibrated" => meta.calibrated = parse_value::<u8>(&key, &value)? != 0,
                _ => debug!(key = %key, "Ignoring unknown metadata key"),
            }
        }
        Ok(meta)
    }

    fn decoder(&self, config: &Config) -> Decoder {
        Decoder::EscapedBurst(EscapedBurstDecoder::new(EscapedConfig {
            average_period_us: config.decoder.average_period_us,
            burst_period_us: config.decoder.burst_period_us,
        }))
    }
}
