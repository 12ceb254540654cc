//! Common data types shared across components
//!
//! This module defines the fixed-width sample record stored in the session
//! log and the helpers every component uses to convert between sample
//! indices, byte offsets and timestamps.

use serde::{Deserialize, Serialize};

pub mod cli;
pub mod metrics;
pub mod shutdown;

pub use metrics::{AcquisitionCounters, CounterSnapshot};

/// Size of one on-disk sample record in bytes
pub const RECORD_SIZE: usize = 6;

/// One sample as stored in the session log
///
/// Memory layout is `value: f32 LE` followed by `bits: u16 LE`. A sample
/// without a value (data loss or decode failure) is stored as NaN so that the
/// index-to-time mapping of the log is preserved.
///
/// ```text
/// offset 0      4      6
///        [value][bits ]
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[repr(C, packed)]
pub struct SampleRecord {
    /// Measured current in microamperes (NaN = no value)
    pub value: f32,
    /// Packed digital channel state
    pub bits: u16,
}

// Compile-time size check: SampleRecord must be exactly 6 bytes
const _: () = assert!(
    std::mem::size_of::<SampleRecord>() == RECORD_SIZE,
    "SampleRecord must be 6 bytes"
);

impl SampleRecord {
    /// Create a record with a value and digital bits
    pub fn new(value: f32, bits: u16) -> Self {
        Self { value, bits }
    }

    /// Create a placeholder record (no value, no bits)
    pub fn placeholder() -> Self {
        Self {
            value: f32::NAN,
            bits: 0,
        }
    }

    /// Create a record from an optional value, mapping `None` to NaN
    pub fn from_parts(value: Option<f32>, bits: Option<u16>) -> Self {
        Self {
            value: value.unwrap_or(f32::NAN),
            bits: bits.unwrap_or(0),
        }
    }

    /// Value, or `None` for a placeholder
    #[inline]
    pub fn value(&self) -> Option<f32> {
        let v = self.value;
        if v.is_nan() {
            None
        } else {
            Some(v)
        }
    }

    /// Encode to the on-disk representation
    #[inline]
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let value = self.value;
        let bits = self.bits;
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&value.to_le_bytes());
        buf[4..6].copy_from_slice(&bits.to_le_bytes());
        buf
    }

    /// Decode from the on-disk representation
    #[inline]
    pub fn from_bytes(data: &[u8; RECORD_SIZE]) -> Self {
        Self {
            value: f32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            bits: u16::from_le_bytes([data[4], data[5]]),
        }
    }

    /// Decode every complete record in a byte slice
    ///
    /// A trailing partial record is ignored.
    pub fn decode_all(data: &[u8]) -> Vec<SampleRecord> {
        data.chunks_exact(RECORD_SIZE)
            .map(|chunk| {
                let mut buf = [0u8; RECORD_SIZE];
                buf.copy_from_slice(chunk);
                Self::from_bytes(&buf)
            })
            .collect()
    }
}

/// Byte offset of a sample index in the session log
#[inline]
pub fn index_to_offset(index: u64) -> u64 {
    index * RECORD_SIZE as u64
}

/// Number of complete samples contained in `bytes` bytes of log
#[inline]
pub fn offset_to_index(bytes: u64) -> u64 {
    bytes / RECORD_SIZE as u64
}

/// Sampling period in microseconds for a rate in samples per second
#[inline]
pub fn sampling_period_us(samples_per_second: f64) -> f64 {
    1_000_000.0 / samples_per_second
}

/// Current Unix time in milliseconds
pub fn unix_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = SampleRecord::new(1.5, 0xA55A);
        let bytes = record.to_bytes();
        assert_eq!(&bytes[0..4], &1.5f32.to_le_bytes());
        assert_eq!(&bytes[4..6], &[0x5A, 0xA5]);
    }

    #[test]
    fn test_placeholder_has_no_value() {
        let record = SampleRecord::placeholder();
        assert_eq!(record.value(), None);

        let restored = SampleRecord::from_bytes(&record.to_bytes());
        assert_eq!(restored.value(), None);
        assert_eq!({ restored.bits }, 0);
    }

    #[test]
    fn test_decode_all_ignores_partial_record() {
        let mut data = Vec::new();
        data.extend_from_slice(&SampleRecord::new(1.0, 1).to_bytes());
        data.extend_from_slice(&SampleRecord::new(2.0, 2).to_bytes());
        data.extend_from_slice(&[0xFF, 0xFF, 0xFF]);

        let records = SampleRecord::decode_all(&data);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value(), Some(2.0));
    }

    #[test]
    fn test_index_offset_conversion() {
        assert_eq!(index_to_offset(10), 60);
        assert_eq!(offset_to_index(61), 10);
        assert!((sampling_period_us(100_000.0) - 10.0).abs() < f64::EPSILON);
    }
}
