//! Escaped-burst decoder for the RTT probe
//!
//! Frames are delimited by STX/ETX sentinels. A payload byte equal to a
//! sentinel (or to ESC itself) is sent as `ESC, byte ^ 0x20`. The payload
//! length selects the frame type:
//!
//! | Length | Meaning |
//! |--------|---------|
//! | 4      | averaged sample, `f32` LE in amperes |
//! | 5      | time base resync, marker byte + `u32` LE microseconds |
//! | other  | burst of `u16` LE words: 2-bit range (bits 14..15), 14-bit ADC |

use tracing::{debug, warn};

use super::common::{DecodeError, DecoderEvent, SampleEvent};

/// Escaped-burst constants
mod constants {
    pub const STX: u8 = 0x02;
    pub const ETX: u8 = 0x03;
    pub const ESC: u8 = 0x1F;
    pub const ESC_XOR: u8 = 0x20;

    pub const AVERAGE_SAMPLE_LEN: usize = 4;
    pub const TIMESTAMP_LEN: usize = 5;
    pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

    pub const MEAS_RANGE_POS: u32 = 14;
    pub const MEAS_RANGE_MASK: u16 = 0b11;
    pub const MEAS_ADC_MASK: u16 = 0x3FFF;

    /// Range selector meaning "no valid range"
    pub const MEAS_RANGE_INVALID: usize = 0;

    pub const ADC_REF: f64 = 0.6;
    pub const ADC_GAIN: f64 = 4.0;
    pub const ADC_MAX: f64 = 8192.0;
    pub const ADC_MULT: f64 = ADC_REF / (ADC_GAIN * ADC_MAX);

    /// Shunt resistors indexed by range selector (index 0 is invalid)
    pub const RESISTORS: [f64; 4] = [f64::NAN, 500.0, 28.0, 1.8];
}

pub use constants::{ESC, ETX, STX};

/// Byte-level receiver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Receiving,
    Escaped,
}

/// Escaped-burst decoder configuration
#[derive(Debug, Clone)]
pub struct EscapedConfig {
    /// Time between averaged samples
    pub average_period_us: f64,
    /// Time between burst samples
    pub burst_period_us: f64,
}

impl Default for EscapedConfig {
    fn default() -> Self {
        Self {
            average_period_us: 130.0,
            burst_period_us: 13.0,
        }
    }
}

/// Escaped-burst decoder
#[derive(Debug, Clone)]
pub struct EscapedBurstDecoder {
    config: EscapedConfig,
    state: ReceiveState,
    payload: Vec<u8>,
    timestamp_us: f64,
    frames_decoded: u64,
    frames_failed: u64,
}

impl EscapedBurstDecoder {
    pub fn new(config: EscapedConfig) -> Self {
        Self {
            config,
            state: ReceiveState::Receiving,
            payload: Vec::with_capacity(256),
            timestamp_us: 0.0,
            frames_decoded: 0,
            frames_failed: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EscapedConfig::default())
    }

    /// Timestamp the next sample will carry
    pub fn timestamp_us(&self) -> f64 {
        self.timestamp_us
    }

    /// (decoded, failed) frame counts
    pub fn frame_counts(&self) -> (u64, u64) {
        (self.frames_decoded, self.frames_failed)
    }

    /// Feed a chunk of the byte stream
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            match self.state {
                ReceiveState::Receiving => match byte {
                    constants::STX => self.payload.clear(),
                    constants::ETX => {
                        let payload = std::mem::take(&mut self.payload);
                        self.dispatch(&payload, &mut events);
                        self.payload = payload;
                        self.payload.clear();
                    }
                    constants::ESC => self.state = ReceiveState::Escaped,
                    _ => self.push_payload(byte, &mut events),
                },
                ReceiveState::Escaped => {
                    self.state = ReceiveState::Receiving;
                    self.push_payload(byte ^ constants::ESC_XOR, &mut events);
                }
            }
        }
        events
    }

    /// Nothing is buffered between frames; a half-received frame is dropped
    pub fn finish(&mut self) -> Vec<DecoderEvent> {
        if !self.payload.is_empty() {
            debug!(bytes = self.payload.len(), "Dropping unterminated frame");
            self.payload.clear();
        }
        self.state = ReceiveState::Receiving;
        Vec::new()
    }

    fn push_payload(&mut self, byte: u8, events: &mut Vec<DecoderEvent>) {
        if self.payload.len() >= constants::MAX_PAYLOAD_LEN {
            self.fail(DecodeError::PayloadOverflow(constants::MAX_PAYLOAD_LEN), events);
            self.payload.clear();
        }
        self.payload.push(byte);
    }

    fn dispatch(&mut self, payload: &[u8], events: &mut Vec<DecoderEvent>) {
        match payload.len() {
            0 => {}
            constants::AVERAGE_SAMPLE_LEN => {
                let amps = f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                events.push(DecoderEvent::Sample(SampleEvent::new(
                    amps * 1e6,
                    None,
                    self.timestamp_us,
                )));
                self.timestamp_us += self.config.average_period_us;
                self.frames_decoded += 1;
            }
            constants::TIMESTAMP_LEN => {
                let micros = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                self.timestamp_us = micros as f64;
                events.push(DecoderEvent::Resync {
                    timestamp_us: self.timestamp_us,
                });
                self.frames_decoded += 1;
            }
            len if len % 2 != 0 => self.fail(DecodeError::OddBurstLength(len), events),
            _ => {
                self.decode_burst(payload, events);
                self.frames_decoded += 1;
            }
        }
    }

    fn decode_burst(&mut self, payload: &[u8], events: &mut Vec<DecoderEvent>) {
        let word_count = payload.len() / 2;
        for (i, pair) in payload.chunks_exact(2).enumerate() {
            let word = u16::from_le_bytes([pair[0], pair[1]]);
            let mut sample = match Self::word_to_amps(word) {
                Ok(amps) => SampleEvent::new((amps * 1e6) as f32, None, self.timestamp_us),
                Err(_) => SampleEvent::placeholder(self.timestamp_us),
            };
            sample.end_of_burst = i + 1 == word_count;
            events.push(DecoderEvent::Sample(sample));
            self.timestamp_us += self.config.burst_period_us;
        }
    }

    /// Convert one burst word to amperes
    fn word_to_amps(word: u16) -> Result<f64, DecodeError> {
        let range = ((word >> constants::MEAS_RANGE_POS) & constants::MEAS_RANGE_MASK) as usize;
        if range == constants::MEAS_RANGE_INVALID {
            return Err(DecodeError::InvalidRange(range as u8));
        }
        let adc = (word & constants::MEAS_ADC_MASK) as f64 * constants::ADC_MULT;
        Ok(adc / constants::RESISTORS[range])
    }

    /// One failed frame occupies one time slot
    fn fail(&mut self, err: DecodeError, events: &mut Vec<DecoderEvent>) {
        warn!(error = %err, "Failed to decode frame");
        self.frames_failed += 1;
        events.push(DecoderEvent::Sample(SampleEvent::placeholder(self.timestamp_us)));
        self.timestamp_us += self.config.average_period_us;
    }
}

/// Escape a payload into one complete frame
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(constants::STX);
    for &byte in payload {
        if byte == constants::STX || byte == constants::ETX || byte == constants::ESC {
            frame.push(constants::ESC);
            frame.push(byte ^ constants::ESC_XOR);
        } else {
            frame.push(byte);
        }
    }
    frame.push(constants::ETX);
    frame
}

/// Pack a burst word from a range selector and a 14-bit ADC code
pub fn burst_word(range: u8, adc: u16) -> u16 {
    ((range as u16 & constants::MEAS_RANGE_MASK) << constants::MEAS_RANGE_POS)
        | (adc & constants::MEAS_ADC_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::common::samples_of;

    #[test]
    fn test_average_sample() {
        let mut decoder = EscapedBurstDecoder::with_defaults();
        let frame = encode_frame(&0.000_5f32.to_le_bytes());
        let samples = samples_of(&decoder.decode(&frame));

        assert_eq!(samples.len(), 1);
        assert!((samples[0].value.unwrap() - 500.0).abs() < 0.01);
        assert_eq!(samples[0].timestamp_us, 0.0);
        assert!((decoder.timestamp_us() - 130.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_escaped_payload_bytes() {
        // payload containing every sentinel must survive escaping
        let value = f32::from_le_bytes([STX, ETX, ESC, 0x40]);
        let frame = encode_frame(&value.to_le_bytes());
        assert!(frame.len() > 6);

        let mut decoder = EscapedBurstDecoder::with_defaults();
        let samples = samples_of(&decoder.decode(&frame));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value.unwrap().to_bits(), (value * 1e6).to_bits());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let frame = encode_frame(&0.001f32.to_le_bytes());
        let mut decoder = EscapedBurstDecoder::with_defaults();

        let (a, b) = frame.split_at(3);
        assert!(decoder.decode(a).is_empty());
        let samples = samples_of(&decoder.decode(b));
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn test_timestamp_resync() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&5000u32.to_le_bytes());
        let mut decoder = EscapedBurstDecoder::with_defaults();

        let events = decoder.decode(&encode_frame(&payload));
        assert_eq!(events, vec![DecoderEvent::Resync { timestamp_us: 5000.0 }]);

        let samples = samples_of(&decoder.decode(&encode_frame(&1e-6f32.to_le_bytes())));
        assert_eq!(samples[0].timestamp_us, 5000.0);
    }

    #[test]
    fn test_burst_decoding() {
        let words = [burst_word(1, 8191), burst_word(2, 4096), burst_word(3, 100)];
        let payload: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();

        let mut decoder = EscapedBurstDecoder::with_defaults();
        let samples = samples_of(&decoder.decode(&encode_frame(&payload)));
        assert_eq!(samples.len(), 3);

        let mult = 0.6 / (4.0 * 8192.0);
        let expected_lo = 8191.0 * mult / 500.0 * 1e6;
        assert!((samples[0].value.unwrap() as f64 - expected_lo).abs() < 1e-3);
        let expected_mid = 4096.0 * mult / 28.0 * 1e6;
        assert!((samples[1].value.unwrap() as f64 - expected_mid).abs() < 1e-2);

        // timestamps advance by the burst period, last sample closes the burst
        assert!((samples[1].timestamp_us - 13.0).abs() < f64::EPSILON);
        assert!(!samples[0].end_of_burst);
        assert!(samples[2].end_of_burst);
    }

    #[test]
    fn test_invalid_range_keeps_slot() {
        let words = [burst_word(0, 100), burst_word(1, 100)];
        let payload: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();

        let mut decoder = EscapedBurstDecoder::with_defaults();
        let samples = samples_of(&decoder.decode(&encode_frame(&payload)));
        assert_eq!(samples.len(), 2);
        assert!(samples[0].is_placeholder());
        assert!(!samples[1].is_placeholder());
    }

    #[test]
    fn test_odd_burst_emits_placeholder_and_continues() {
        let mut decoder = EscapedBurstDecoder::with_defaults();
        let mut stream = encode_frame(&[1, 2, 3]);
        stream.extend(encode_frame(&1e-6f32.to_le_bytes()));

        let samples = samples_of(&decoder.decode(&stream));
        assert_eq!(samples.len(), 2);
        assert!(samples[0].is_placeholder());
        assert!(!samples[1].is_placeholder());
        assert_eq!(decoder.frame_counts(), (1, 1));
    }
}
