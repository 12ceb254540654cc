//! Probe emulator - synthetic fixed-frame byte stream
//!
//! Produces the bytes a serial probe would send: a base current with
//! Gaussian noise, periodic current pulses that force range switches, a
//! walking pattern on the digital channels, and optional counter gaps that
//! exercise the decoder's loss handling.
//!
//! Currents are converted to ADC codes by inverting the default
//! calibration, so a decoder with default modifiers reads back values
//! close to the requested ones.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use crate::decoder::calibration::DEFAULT_ADC_MULT;
use crate::decoder::fixed_frame::{COUNTER_MODULUS, FRAME_SIZE};
use crate::decoder::{Modifiers, RawFrame, NUM_RANGES};

/// Largest value of the 14-bit ADC field
const ADC_FIELD_MAX: f64 = 16_383.0;

/// The ADC field holds a 16-bit conversion shifted right by two
const ADC_FIELD_SCALE: f64 = 4.0;

/// Emulator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Current between pulses in microamperes
    pub base_current_ua: f64,
    /// Relative standard deviation of the noise
    pub noise_ratio: f64,
    /// Pulse height in microamperes (0 = no pulses)
    pub pulse_current_ua: f64,
    /// Frames between pulse starts
    pub pulse_every: u64,
    /// Frames per pulse
    pub pulse_len: u64,
    /// Drive the digital channels
    pub digital_channels: bool,
    /// Frames between injected counter gaps (0 = no gaps)
    pub gap_every: u64,
    /// Counter values skipped per gap
    pub gap_len: u8,
    /// Frames per chunk in streaming mode
    pub chunk_frames: usize,
    /// Delay between chunks in milliseconds (0 = as fast as possible)
    pub chunk_interval_ms: u64,
    /// RNG seed
    pub seed: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            base_current_ua: 50.0,
            noise_ratio: 0.02,
            pulse_current_ua: 5_000.0,
            pulse_every: 10_000,
            pulse_len: 200,
            digital_channels: true,
            gap_every: 0,
            gap_len: 2,
            chunk_frames: 1_000,
            chunk_interval_ms: 10,
            seed: 0x5EED,
        }
    }
}

/// Synthetic fixed-frame probe
#[derive(Debug)]
pub struct ProbeEmulator {
    config: EmulatorConfig,
    modifiers: Modifiers,
    rng: StdRng,
    /// `None` when the noise ratio is not a valid deviation
    noise: Option<Normal<f64>>,
    frame_index: u64,
    counter: u8,
    gaps_injected: u64,
}

impl ProbeEmulator {
    pub fn new(config: EmulatorConfig) -> Self {
        let noise = Normal::new(0.0, config.noise_ratio).ok();
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            modifiers: Modifiers::default(),
            noise,
            frame_index: 0,
            counter: 0,
            gaps_injected: 0,
            config,
        }
    }

    /// Frames generated so far
    pub fn frames_generated(&self) -> u64 {
        self.frame_index
    }

    /// Counter gaps injected so far
    pub fn gaps_injected(&self) -> u64 {
        self.gaps_injected
    }

    /// Nominal current of frame `index` before noise
    pub fn nominal_current_ua(&self, index: u64) -> f64 {
        let c = &self.config;
        if c.pulse_current_ua > 0.0 && c.pulse_every > 0 && index % c.pulse_every < c.pulse_len {
            c.pulse_current_ua
        } else {
            c.base_current_ua
        }
    }

    /// Smallest-current range able to represent `current_ua`, with its ADC code
    pub fn encode_current(&self, current_ua: f64) -> (u8, u16) {
        let amps = current_ua.max(0.0) / 1e6;
        // default gains: amps = w * (w + 1), w = code * mult / R
        let w = ((1.0 + 4.0 * amps).sqrt() - 1.0) / 2.0;
        for range in 0..NUM_RANGES {
            let code = w * self.modifiers.r[range] / DEFAULT_ADC_MULT / ADC_FIELD_SCALE;
            if code <= ADC_FIELD_MAX {
                return (range as u8, code.round() as u16);
            }
        }
        (NUM_RANGES as u8 - 1, ADC_FIELD_MAX as u16)
    }

    fn next_frame(&mut self) -> RawFrame {
        let index = self.frame_index;
        let c = &self.config;
        if c.gap_every > 0 && index > 0 && index % c.gap_every == 0 {
            self.counter = Self::advance(self.counter, c.gap_len);
            self.gaps_injected += 1;
        }

        let nominal = self.nominal_current_ua(index);
        let jitter = match &self.noise {
            Some(noise) => noise.sample(&mut self.rng),
            None => 0.0,
        };
        let current = nominal * (1.0 + jitter);
        let (range, adc) = self.encode_current(current);
        let logic = if self.config.digital_channels {
            // bit 0 marks pulses, bits 1..7 walk every 64 frames
            (1u8 << (1 + index / 64 % 7)) | u8::from(nominal > self.config.base_current_ua)
        } else {
            0
        };

        let frame = RawFrame {
            adc,
            range,
            counter: self.counter,
            logic,
        };
        self.counter = Self::advance(self.counter, 1);
        self.frame_index += 1;
        frame
    }

    #[inline]
    fn advance(counter: u8, by: u8) -> u8 {
        ((counter as u16 + by as u16) % COUNTER_MODULUS as u16) as u8
    }

    /// Bytes of the next `frames` frames
    pub fn generate(&mut self, frames: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(frames * FRAME_SIZE);
        for _ in 0..frames {
            out.extend_from_slice(&self.next_frame().pack().to_le_bytes());
        }
        out
    }

    /// Stream `total_frames` frames through an in-memory pipe
    ///
    /// The returned reader behaves like a probe link: chunks arrive at the
    /// configured interval and the stream ends after the last frame.
    pub fn spawn_stream(mut self, total_frames: u64) -> (DuplexStream, JoinHandle<u64>) {
        let chunk_frames = self.config.chunk_frames.max(1);
        let (mut tx, rx) = tokio::io::duplex(chunk_frames * FRAME_SIZE * 4);
        let interval_ms = self.config.chunk_interval_ms;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
            info!(total_frames, chunk_frames, interval_ms, "Emulator stream started");

            while self.frame_index < total_frames {
                if interval_ms > 0 {
                    ticker.tick().await;
                }
                let n = (total_frames - self.frame_index).min(chunk_frames as u64) as usize;
                let bytes = self.generate(n);
                if let Err(e) = tx.write_all(&bytes).await {
                    debug!(error = %e, "Emulator reader went away");
                    break;
                }
            }
            let _ = tx.shutdown().await;
            info!(
                frames = self.frame_index,
                gaps = self.gaps_injected,
                "Emulator stream finished"
            );
            self.frame_index
        });
        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{samples_of, DecoderEvent, FixedFrameDecoder};
    use tokio::io::AsyncReadExt;

    fn quiet() -> EmulatorConfig {
        EmulatorConfig {
            noise_ratio: 0.0,
            chunk_interval_ms: 0,
            ..EmulatorConfig::default()
        }
    }

    #[test]
    fn test_encode_current_picks_range() {
        let emulator = ProbeEmulator::new(quiet());
        assert_eq!(emulator.encode_current(1.0).0, 0);
        assert_eq!(emulator.encode_current(500.0).0, 0);
        assert_eq!(emulator.encode_current(5_000.0).0, 1);
        assert_eq!(emulator.encode_current(50_000.0).0, 2);
        assert_eq!(emulator.encode_current(1e9).0, NUM_RANGES as u8 - 1);
    }

    #[test]
    fn test_decoded_current_matches() {
        let mut emulator = ProbeEmulator::new(EmulatorConfig {
            pulse_every: 100,
            pulse_len: 10,
            ..quiet()
        });
        let bytes = emulator.generate(100);
        let mut decoder = FixedFrameDecoder::with_defaults();
        let samples = samples_of(&decoder.decode(&bytes));
        assert_eq!(samples.len(), 100);

        // settled samples away from the range switches
        let pulse = samples[5].value.unwrap();
        let base = samples[50].value.unwrap();
        assert!((pulse - 5_000.0).abs() / 5_000.0 < 0.01, "pulse {pulse}");
        assert!((base - 50.0).abs() / 50.0 < 0.01, "base {base}");
        assert_eq!(samples[5].bits.unwrap() & 1, 1);
        assert_eq!(samples[50].bits.unwrap() & 1, 0);
    }

    #[test]
    fn test_injected_gaps_become_placeholders() {
        let mut emulator = ProbeEmulator::new(EmulatorConfig {
            gap_every: 500,
            gap_len: 3,
            pulse_current_ua: 0.0,
            ..quiet()
        });
        let bytes = emulator.generate(2_000);
        assert_eq!(emulator.gaps_injected(), 3);

        let mut decoder = FixedFrameDecoder::with_defaults();
        let mut events = decoder.decode(&bytes);
        events.extend(decoder.finish());

        let samples = samples_of(&events);
        assert_eq!(samples.len(), 2_000 + 9);
        assert_eq!(samples.iter().filter(|s| s.is_placeholder()).count(), 9);
        let lost: u64 = events
            .iter()
            .map(|e| match e {
                DecoderEvent::DataLoss { missing, .. } => *missing,
                _ => 0,
            })
            .sum();
        assert_eq!(lost, 9);
    }

    #[test]
    fn test_seed_is_deterministic() {
        let config = EmulatorConfig::default();
        let a = ProbeEmulator::new(config.clone()).generate(256);
        let b = ProbeEmulator::new(config).generate(256);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_stream_delivers_all_frames() {
        let emulator = ProbeEmulator::new(EmulatorConfig {
            chunk_frames: 64,
            ..quiet()
        });
        let (mut rx, handle) = emulator.spawn_stream(1_000);
        let mut bytes = Vec::new();
        rx.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes.len(), 1_000 * FRAME_SIZE);
        assert_eq!(handle.await.unwrap(), 1_000);
    }
}
