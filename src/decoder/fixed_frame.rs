//! Fixed-frame decoder for the serial probe
//!
//! Every frame is one `u32` little-endian word:
//!
//! ```text
//! bit  31      24 23    18 17  14 13            0
//!      [ logic  ][counter][range][      adc      ]
//! ```
//!
//! Frames may straddle chunk boundaries; the trailing partial frame of a
//! chunk is kept and completed by the next one. The 6-bit rolling counter
//! detects lost or corrupted frames.

use tracing::{debug, warn};

use super::calibration::Calibration;
use super::common::{DecoderEvent, SampleEvent};
use crate::config::SpikeFilterConfig;

/// Fixed-frame constants
mod constants {
    pub const FRAME_SIZE: usize = 4;

    pub const ADC_MASK: u32 = 0x3FFF;
    pub const RANGE_SHIFT: u32 = 14;
    pub const RANGE_MASK: u32 = 0x7;
    pub const COUNTER_SHIFT: u32 = 18;
    pub const COUNTER_MASK: u32 = 0x3F;
    pub const LOGIC_SHIFT: u32 = 24;
    pub const LOGIC_MASK: u32 = 0xFF;

    /// The ADC field is the top 14 bits of a 16-bit conversion
    pub const ADC_SCALE: u32 = 4;

    /// Modulus of the rolling counter
    pub const COUNTER_MODULUS: u8 = 64;
}

pub use constants::{COUNTER_MODULUS, FRAME_SIZE};

/// Fixed-frame decoder configuration
#[derive(Debug, Clone)]
pub struct FixedFrameConfig {
    /// Sampling period in microseconds
    pub sampling_period_us: f64,
    /// Out-of-sequence frames held before a gap is declared
    pub resync_window: usize,
    /// Loss warning threshold in samples
    pub loss_threshold: u64,
    /// Supply voltage in millivolts
    pub vdd_mv: u16,
    /// Spike filter coefficients
    pub spike_filter: SpikeFilterConfig,
}

impl Default for FixedFrameConfig {
    fn default() -> Self {
        Self {
            sampling_period_us: 10.0,
            resync_window: 4,
            loss_threshold: 500,
            vdd_mv: 3000,
            spike_filter: SpikeFilterConfig::default(),
        }
    }
}

/// One unpacked frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub adc: u16,
    pub range: u8,
    pub counter: u8,
    pub logic: u8,
}

impl RawFrame {
    pub fn unpack(word: u32) -> Self {
        Self {
            adc: (word & constants::ADC_MASK) as u16,
            range: ((word >> constants::RANGE_SHIFT) & constants::RANGE_MASK) as u8,
            counter: ((word >> constants::COUNTER_SHIFT) & constants::COUNTER_MASK) as u8,
            logic: ((word >> constants::LOGIC_SHIFT) & constants::LOGIC_MASK) as u8,
        }
    }

    pub fn pack(&self) -> u32 {
        (self.adc as u32 & constants::ADC_MASK)
            | ((self.range as u32 & constants::RANGE_MASK) << constants::RANGE_SHIFT)
            | ((self.counter as u32 & constants::COUNTER_MASK) << constants::COUNTER_SHIFT)
            | ((self.logic as u32 & constants::LOGIC_MASK) << constants::LOGIC_SHIFT)
    }
}

/// Value and bits of a frame before it is placed on the time axis
#[derive(Debug, Clone, Copy)]
struct PendingSample {
    value: Option<f32>,
    bits: u16,
}

/// Fixed-frame decoder
#[derive(Debug, Clone)]
pub struct FixedFrameDecoder {
    config: FixedFrameConfig,
    calibration: Calibration,
    remainder: Vec<u8>,
    expected_counter: Option<u8>,
    corrupted: Vec<PendingSample>,
    sample_index: u64,
    total_lost: u64,
    total_replayed: u64,
}

impl FixedFrameDecoder {
    pub fn new(config: FixedFrameConfig) -> Self {
        let calibration = Calibration::new(config.vdd_mv, config.spike_filter);
        Self {
            config,
            calibration,
            remainder: Vec::with_capacity(constants::FRAME_SIZE),
            expected_counter: None,
            corrupted: Vec::new(),
            sample_index: 0,
            total_lost: 0,
            total_replayed: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FixedFrameConfig::default())
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn calibration_mut(&mut self) -> &mut Calibration {
        &mut self.calibration
    }

    /// Samples emitted so far (placeholders included)
    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }

    /// Samples declared lost so far
    pub fn total_lost(&self) -> u64 {
        self.total_lost
    }

    /// Out-of-sequence frames replayed after resynchronization
    pub fn total_replayed(&self) -> u64 {
        self.total_replayed
    }

    /// Feed a chunk of the byte stream
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<DecoderEvent> {
        let mut events = Vec::with_capacity(chunk.len() / constants::FRAME_SIZE + 1);
        let mut rest = chunk;

        if !self.remainder.is_empty() {
            let needed = constants::FRAME_SIZE - self.remainder.len();
            let take = needed.min(rest.len());
            self.remainder.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.remainder.len() < constants::FRAME_SIZE {
                return events;
            }
            let word = u32::from_le_bytes([
                self.remainder[0],
                self.remainder[1],
                self.remainder[2],
                self.remainder[3],
            ]);
            self.remainder.clear();
            self.handle_frame(word, &mut events);
        }

        let mut frames = rest.chunks_exact(constants::FRAME_SIZE);
        for frame in &mut frames {
            let word = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            self.handle_frame(word, &mut events);
        }
        self.remainder.extend_from_slice(frames.remainder());

        events
    }

    /// Flush frames still held for resynchronization at end of stream
    pub fn finish(&mut self) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        if !self.remainder.is_empty() {
            debug!(bytes = self.remainder.len(), "Dropping partial trailing frame");
            self.remainder.clear();
        }
        let pending = std::mem::take(&mut self.corrupted);
        for sample in pending {
            self.emit(sample, &mut events);
        }
        events
    }

    fn handle_frame(&mut self, word: u32, events: &mut Vec<DecoderEvent>) {
        let frame = RawFrame::unpack(word);
        let value = match self
            .calibration
            .adc_result(frame.range as usize, frame.adc as u32 * constants::ADC_SCALE)
        {
            Ok(amps) => Some((amps * 1e6) as f32),
            Err(e) => {
                debug!(error = %e, word = format!("{:08x}", word), "Frame decode failed");
                None
            }
        };
        let sample = PendingSample {
            value,
            bits: frame.logic as u16,
        };

        match self.expected_counter {
            None => {
                self.emit(sample, events);
            }
            Some(expected) if frame.counter == expected => {
                if !self.corrupted.is_empty() {
                    let replay = std::mem::take(&mut self.corrupted);
                    debug!(frames = replay.len(), "Counter resynchronized, replaying frames");
                    self.total_replayed += replay.len() as u64;
                    for pending in replay {
                        self.emit(pending, events);
                    }
                }
                self.emit(sample, events);
            }
            Some(expected) if self.corrupted.len() < self.config.resync_window => {
                // assume a transient fault; hold the frame in its slot
                self.corrupted.push(sample);
                self.expected_counter = Some(Self::next_counter(expected));
                return;
            }
            Some(expected) => {
                let missing = counter_gap(frame.counter, expected) as u64;
                self.report_loss(missing, events);
                for _ in 0..missing {
                    self.emit_placeholder(events);
                }
                let held = std::mem::take(&mut self.corrupted);
                for pending in held {
                    self.emit(pending, events);
                }
                self.emit(sample, events);
            }
        }
        self.expected_counter = Some(Self::next_counter(frame.counter));
    }

    fn report_loss(&mut self, missing: u64, events: &mut Vec<DecoderEvent>) {
        let before = self.total_lost;
        self.total_lost += missing;
        let threshold = self.config.loss_threshold.max(1);
        let threshold_crossed = before / threshold < self.total_lost / threshold;

        if threshold_crossed {
            warn!(
                missing,
                total_lost = self.total_lost,
                threshold,
                "Data loss detected, probe link cannot keep up"
            );
        } else {
            debug!(missing, total_lost = self.total_lost, "Counter gap filled");
        }

        events.push(DecoderEvent::DataLoss {
            missing,
            total_lost: self.total_lost,
            threshold_crossed,
        });
    }

    fn emit(&mut self, sample: PendingSample, events: &mut Vec<DecoderEvent>) {
        let timestamp_us = self.sample_index as f64 * self.config.sampling_period_us;
        events.push(DecoderEvent::Sample(SampleEvent {
            value: sample.value,
            bits: Some(sample.bits),
            timestamp_us,
            end_of_burst: false,
        }));
        self.sample_index += 1;
    }

    fn emit_placeholder(&mut self, events: &mut Vec<DecoderEvent>) {
        let timestamp_us = self.sample_index as f64 * self.config.sampling_period_us;
        events.push(DecoderEvent::Sample(SampleEvent::placeholder(timestamp_us)));
        self.sample_index += 1;
    }

    #[inline]
    fn next_counter(counter: u8) -> u8 {
        (counter + 1) % constants::COUNTER_MODULUS
    }
}

/// Frames missing between `expected` and `counter` on the rolling counter
#[inline]
pub fn counter_gap(counter: u8, expected: u8) -> u8 {
    (counter + constants::COUNTER_MODULUS - expected) % constants::COUNTER_MODULUS
}
