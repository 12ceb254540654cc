//! Serial probe transport (fixed-frame wire variant)
//!
//! Commands are written as raw bytes. The device streams continuously;
//! triggering is done in software. On connect the device reports its
//! calibration modifiers as `key: value` lines, which are kept here and
//! installed in every decoder this transport builds.

use std::io::Write;

use tracing::{debug, info};

use super::{
    command, float_to_le_bytes, parse_key_values, parse_value, Capabilities, DeviceMetadata,
    Transport, TransportError,
};
use crate::config::Config;
use crate::decoder::{Decoder, FixedFrameConfig, FixedFrameDecoder, Modifiers, NUM_RANGES};

const CAPABILITIES: Capabilities = Capabilities {
    hard_trigger: false,
    pre_post_trigger: true,
    digital_channels: true,
    external_trigger: false,
    spike_filter: false,
    vdd_control: true,
    sampling_period_us: 10.0,
};

/// Transport for the serial probe
#[derive(Debug)]
pub struct SerialTransport<W: Write> {
    sink: W,
    modifiers: Modifiers,
    vdd_mv: Option<u16>,
    running: bool,
}

impl<W: Write> SerialTransport<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            modifiers: Modifiers::default(),
            vdd_mv: None,
            running: false,
        }
    }

    pub fn modifiers(&self) -> &Modifiers {
        &self.modifiers
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    /// Ask the device to report its metadata
    pub fn request_metadata(&mut self) -> Result<(), TransportError> {
        self.send_command(&[command::GET_METADATA])
    }

    /// Power the device under test on or off
    pub fn set_device_running(&mut self, on: bool) -> Result<(), TransportError> {
        self.send_command(&[command::DEVICE_RUNNING_SET, on as u8])
    }

    /// Set the user gain of one range, on the device and locally
    pub fn set_user_gain(&mut self, range: usize, gain: f32) -> Result<(), TransportError> {
        if range >= NUM_RANGES {
            return Err(TransportError::InvalidMetadata {
                key: "range".to_string(),
                value: range.to_string(),
            });
        }
        let mut cmd = vec![command::SET_USER_GAINS, range as u8];
        cmd.extend_from_slice(&float_to_le_bytes(gain));
        self.send_command(&cmd)?;
        self.modifiers.ug[range] = gain as f64;
        Ok(())
    }

    fn apply_modifier(&mut self, key: &str, value: &str) -> Result<bool, TransportError> {
        let split = key.find(|c: char| c.is_ascii_digit());
        let Some(split) = split else {
            return Ok(false);
        };
        let (name, index) = key.split_at(split);
        let Ok(index) = index.parse::<usize>() else {
            return Ok(false);
        };
        if index >= NUM_RANGES {
            return Ok(false);
        }
        let table = match name {
            "r" => &mut self.modifiers.r,
            "gs" => &mut self.modifiers.gs,
            "gi" => &mut self.modifiers.gi,
            "o" => &mut self.modifiers.o,
            "s" => &mut self.modifiers.s,
            "i" => &mut self.modifiers.i,
            "ug" => &mut self.modifiers.ug,
            _ => return Ok(false),
        };
        table[index] = parse_value(key, value)?;
        Ok(true)
    }
}

impl<W: Write> Transport for SerialTransport<W> {
    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    fn send_command(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        debug!(code = cmd.first().copied().unwrap_or_default(), len = cmd.len(), "Serial command");
        self.sink.write_all(cmd)?;
        self.sink.flush()?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        self.send_command(&[command::AVERAGE_START])?;
        self.running = true;
        info!("Serial probe started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.send_command(&[command::AVERAGE_STOP])?;
        self.running = false;
        info!("Serial probe stopped");
        Ok(())
    }

    fn parse_meta(&mut self, text: &str) -> Result<DeviceMetadata, TransportError> {
        let mut meta = DeviceMetadata::default();
        for (key, value) in parse_key_values(text)? {
            let key = key.to_ascii_lowercase();
            match key.as_str() {
                "vdd" => meta.vdd_mv = Some(parse_value(&key, &value)?),
                "hw" => meta.hw = Some(parse_value(&key, &value)?),
                "mode" => meta.mode = Some(parse_value(&key, &value)?),
                "calibrated" => meta.calibrated = parse_value::<u8>(&key, &value)? != 0,
                "ia" => meta.ia = Some(parse_value(&key, &value)?),
                _ => {
                    if !self.apply_modifier(&key, &value)? {
                        debug!(key = %key, "Ignoring unknown metadata key");
                    }
                }
            }
        }
        self.vdd_mv = meta.vdd_mv.or(self.vdd_mv);
        meta.modifiers = Some(self.modifiers.clone());
        info!(hw = ?meta.hw, calibrated = meta.calibrated, "Serial probe metadata parsed");
        Ok(meta)
    }

    fn decoder(&self, config: &Config) -> Decoder {
        let mut decoder = FixedFrameDecoder::new(FixedFrameConfig {
            sampling_period_us: config.sampling_period_us(),
            resync_window: config.decoder.resync_window,
            loss_threshold: config.decoder.loss_threshold,
            vdd_mv: self.vdd_mv.unwrap_or(config.decoder.vdd_mv),
            spike_filter: config.spike_filter,
        });
        decoder.calibration_mut().modifiers = self.modifiers.clone();
        Decoder::FixedFrame(decoder)
    }
}
