//! Decoder module for probe wire protocols
//!
//! Converts the raw byte stream of a probe into timestamped samples. Two
//! wire variants exist; [`Decoder`] dispatches to the one selected in the
//! configuration.

pub mod calibration;
pub mod common;
pub mod escaped;
pub mod fixed_frame;

pub use calibration::{Calibration, Modifiers, NUM_RANGES};
pub use common::{samples_of, DecodeError, DecoderEvent, SampleEvent, WireVariant};
pub use escaped::{EscapedBurstDecoder, EscapedConfig};
pub use fixed_frame::{FixedFrameConfig, FixedFrameDecoder, RawFrame};

use crate::config::Config;

/// Decoder for either wire variant
#[derive(Debug, Clone)]
pub enum Decoder {
    EscapedBurst(EscapedBurstDecoder),
    FixedFrame(FixedFrameDecoder),
}

impl Decoder {
    /// Build the decoder selected by `config.decoder.variant`
    pub fn from_config(config: &Config) -> Self {
        match config.decoder.variant {
            WireVariant::EscapedBurst => Decoder::EscapedBurst(EscapedBurstDecoder::new(EscapedConfig {
                average_period_us: config.decoder.average_period_us,
                burst_period_us: config.decoder.burst_period_us,
            })),
            WireVariant::FixedFrame => Decoder::FixedFrame(FixedFrameDecoder::new(FixedFrameConfig {
                sampling_period_us: config.sampling_period_us(),
                resync_window: config.decoder.resync_window,
                loss_threshold: config.decoder.loss_threshold,
                vdd_mv: config.decoder.vdd_mv,
                spike_filter: config.spike_filter,
            })),
        }
    }

    pub fn variant(&self) -> WireVariant {
        match self {
            Decoder::EscapedBurst(_) => WireVariant::EscapedBurst,
            Decoder::FixedFrame(_) => WireVariant::FixedFrame,
        }
    }

    /// Feed a chunk of the byte stream
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<DecoderEvent> {
        match self {
            Decoder::EscapedBurst(d) => d.decode(chunk),
            Decoder::FixedFrame(d) => d.decode(chunk),
        }
    }

    /// End of stream
    pub fn finish(&mut self) -> Vec<DecoderEvent> {
        match self {
            Decoder::EscapedBurst(d) => d.finish(),
            Decoder::FixedFrame(d) => d.finish(),
        }
    }

    /// Frames replayed after counter resynchronization
    pub fn total_replayed(&self) -> u64 {
        match self {
            Decoder::EscapedBurst(_) => 0,
            Decoder::FixedFrame(d) => d.total_replayed(),
        }
    }

    /// Calibration state, only present on the fixed-frame variant
    pub fn calibration_mut(&mut self) -> Option<&mut Calibration> {
        match self {
            Decoder::EscapedBurst(_) => None,
            Decoder::FixedFrame(d) => Some(d.calibration_mut()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_selects_variant() {
        let mut config = Config::default();
        assert_eq!(Decoder::from_config(&config).variant(), WireVariant::FixedFrame);

        config.decoder.variant = WireVariant::EscapedBurst;
        let mut decoder = Decoder::from_config(&config);
        assert_eq!(decoder.variant(), WireVariant::EscapedBurst);
        assert!(decoder.calibration_mut().is_none());
    }

    #[test]
    fn test_fixed_frame_uses_session_rate() {
        let mut config = Config::default();
        config.session.samples_per_second = 1000.0;
        let mut decoder = Decoder::from_config(&config);

        let bytes: Vec<u8> = (0..3u8)
            .flat_map(|c| {
                RawFrame {
                    adc: 100,
                    range: 2,
                    counter: c,
                    logic: 0,
                }
                .pack()
                .to_le_bytes()
            })
            .collect();
        let samples = samples_of(&decoder.decode(&bytes));
        assert_eq!(samples.len(), 3);
        assert!((samples[2].timestamp_us - 2000.0).abs() < 1e-9);
    }
}
