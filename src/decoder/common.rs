//! Common types for decoder module

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::SampleRecord;

/// Wire variant spoken by the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WireVariant {
    /// Sentinel-delimited frames with byte escaping (RTT probe)
    #[serde(rename = "escaped")]
    EscapedBurst,
    /// Constant 4-byte little-endian frames (serial probe)
    #[default]
    #[serde(rename = "fixed")]
    FixedFrame,
}

impl std::fmt::Display for WireVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireVariant::EscapedBurst => write!(f, "escaped-burst"),
            WireVariant::FixedFrame => write!(f, "fixed-frame"),
        }
    }
}

/// Per-frame decode failures
///
/// These never abort a stream. The decoder turns them into a placeholder
/// sample so that the sample index keeps matching the time axis.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("measurement range {0} out of bounds")]
    InvalidRange(u8),

    #[error("burst payload has odd length {0}")]
    OddBurstLength(usize),

    #[error("frame payload exceeded {0} bytes without end-of-frame")]
    PayloadOverflow(usize),
}

/// One decoded sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleEvent {
    /// Current in microamperes, `None` for a placeholder
    pub value: Option<f32>,
    /// Digital channel bits, `None` when the variant has no logic port
    pub bits: Option<u16>,
    /// Timestamp in microseconds since the start of the stream
    pub timestamp_us: f64,
    /// Last sample of a hardware-triggered burst
    pub end_of_burst: bool,
}

impl SampleEvent {
    /// Create a sample with a value
    pub fn new(value: f32, bits: Option<u16>, timestamp_us: f64) -> Self {
        Self {
            value: Some(value),
            bits,
            timestamp_us,
            end_of_burst: false,
        }
    }

    /// Create a placeholder sample that only holds its time slot
    pub fn placeholder(timestamp_us: f64) -> Self {
        Self {
            value: None,
            bits: None,
            timestamp_us,
            end_of_burst: false,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.value.is_none()
    }

    /// Fixed-width record for the session log
    pub fn to_record(&self) -> SampleRecord {
        SampleRecord::from_parts(self.value, self.bits)
    }
}

/// Everything a decoder can report
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    /// A sample (real or placeholder)
    Sample(SampleEvent),
    /// The probe re-announced its time base
    Resync { timestamp_us: f64 },
    /// A counter gap was resolved as lost data
    DataLoss {
        /// Samples missing in this gap
        missing: u64,
        /// Samples lost since the stream started
        total_lost: u64,
        /// Whether this gap pushed the total across a loss threshold
        threshold_crossed: bool,
    },
}

impl DecoderEvent {
    /// The sample carried by this event, if any
    pub fn sample(&self) -> Option<&SampleEvent> {
        match self {
            DecoderEvent::Sample(sample) => Some(sample),
            _ => None,
        }
    }
}

/// Collect only the samples from a batch of events
pub fn samples_of(events: &[DecoderEvent]) -> Vec<SampleEvent> {
    events.iter().filter_map(|e| e.sample().copied()).collect()
}
