//! Legacy single-stream recordings
//!
//! The whole file is one LZ4 block with its uncompressed size prepended.
//! The payload is a sequence of blocks, each a u32 LE length followed by
//! that many bytes:
//!
//! ```text
//! versioned:   [metadata JSON][f32 LE values][u16 LE bits]?
//! unversioned: [options JSON][chart state JSON][f32 LE values][u16 LE bits]?
//! ```
//!
//! Versioned metadata carries a `version` key and nests the acquisition
//! options under `options`. The rate comes from `samplesPerSecond` or, in
//! older files, from `samplingTime` in microseconds.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::common::sampling_period_us;
use crate::decoder::SampleEvent;

/// Legacy loader errors
#[derive(Error, Debug)]
pub enum LegacyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LZ4 decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("Metadata parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Block at offset {offset} needs {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Missing {0} block")]
    MissingBlock(&'static str),

    #[error("{what} block length {len} is not a multiple of {width}")]
    Misaligned {
        what: &'static str,
        len: usize,
        width: usize,
    },

    #[error("Recording has no usable sampling rate")]
    MissingRate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyOptions {
    samples_per_second: Option<f64>,
    /// Sampling period in microseconds
    sampling_time: Option<f64>,
    /// Unix milliseconds of the first sample
    timestamp: Option<i64>,
}

impl LegacyOptions {
    fn rate(&self) -> Option<f64> {
        self.samples_per_second
            .filter(|sps| *sps > 0.0)
            .or_else(|| {
                self.sampling_time
                    .filter(|t| *t > 0.0)
                    .map(|t| 1_000_000.0 / t)
            })
    }
}

/// A decoded legacy recording
#[derive(Debug, Clone)]
pub struct LegacyRecording {
    pub samples_per_second: f64,
    pub start_system_time: Option<i64>,
    /// NaN marks a missing value
    pub values: Vec<f32>,
    pub bits: Option<Vec<u16>>,
    /// Chart state of unversioned files, kept opaque
    pub chart_state: Option<Value>,
}

impl LegacyRecording {
    /// Samples timestamped from zero at the recording rate
    pub fn samples(&self) -> Vec<SampleEvent> {
        let period = sampling_period_us(self.samples_per_second);
        self.values
            .iter()
            .enumerate()
            .map(|(i, &value)| {
                let timestamp_us = i as f64 * period;
                let bits = self.bits.as_ref().and_then(|b| b.get(i).copied());
                if value.is_nan() {
                    SampleEvent {
                        bits,
                        ..SampleEvent::placeholder(timestamp_us)
                    }
                } else {
                    SampleEvent::new(value, bits, timestamp_us)
                }
            })
            .collect()
    }
}

struct Blocks<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Blocks<'a> {
    fn next_block(&mut self) -> Result<Option<&'a [u8]>, LegacyError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let available = self.data.len() - self.pos;
        if available < 4 {
            return Err(LegacyError::Truncated {
                offset: self.pos,
                needed: 4,
                available,
            });
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        let len = u32::from_le_bytes(len) as usize;
        let start = self.pos + 4;
        if self.data.len() - start < len {
            return Err(LegacyError::Truncated {
                offset: start,
                needed: len,
                available: self.data.len() - start,
            });
        }
        self.pos = start + len;
        Ok(Some(&self.data[start..start + len]))
    }

    fn require(&mut self, what: &'static str) -> Result<&'a [u8], LegacyError> {
        self.next_block()?.ok_or(LegacyError::MissingBlock(what))
    }
}

/// Decode a legacy file already read into memory
pub fn parse_legacy(compressed: &[u8]) -> Result<LegacyRecording, LegacyError> {
    let payload = lz4_flex::block::decompress_size_prepended(compressed)?;
    let mut blocks = Blocks {
        data: &payload,
        pos: 0,
    };

    let first: Value = serde_json::from_slice(blocks.require("metadata")?)?;
    let (options, chart_state) = if first.get("version").is_some() {
        debug!(version = %first["version"], "Versioned legacy metadata");
        let options = first.get("options").cloned().unwrap_or_else(|| first.clone());
        (options, None)
    } else {
        let chart_state: Value = serde_json::from_slice(blocks.require("chart state")?)?;
        (first, Some(chart_state))
    };
    let options: LegacyOptions = serde_json::from_value(options)?;
    let samples_per_second = options.rate().ok_or(LegacyError::MissingRate)?;

    let raw = blocks.require("samples")?;
    if raw.len() % 4 != 0 {
        return Err(LegacyError::Misaligned {
            what: "samples",
            len: raw.len(),
            width: 4,
        });
    }
    let values: Vec<f32> = raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let bits = match blocks.next_block()? {
        Some(raw) if raw.len() % 2 != 0 => {
            return Err(LegacyError::Misaligned {
                what: "bits",
                len: raw.len(),
                width: 2,
            })
        }
        Some(raw) => Some(
            raw.chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        None => None,
    };

    Ok(LegacyRecording {
        samples_per_second,
        start_system_time: options.timestamp,
        values,
        bits,
        chart_state,
    })
}

/// Read and decode a legacy file
pub fn load_legacy<P: AsRef<Path>>(path: P) -> Result<LegacyRecording, LegacyError> {
    let path = path.as_ref();
    let compressed = std::fs::read(path)?;
    let recording = parse_legacy(&compressed)?;
    info!(
        path = %path.display(),
        samples = recording.values.len(),
        samples_per_second = recording.samples_per_second,
        has_bits = recording.bits.is_some(),
        "Loaded legacy recording"
    );
    Ok(recording)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(out: &mut Vec<u8>, data: &[u8]) {
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }

    fn values_block(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_versioned_with_bits() {
        let mut payload = Vec::new();
        block(
            &mut payload,
            br#"{"version":"2.1.0","options":{"samplesPerSecond":100000,"timestamp":1600000000000}}"#,
        );
        block(&mut payload, &values_block(&[1.0, f32::NAN, 3.0]));
        block(&mut payload, &[1, 0, 2, 0, 3, 0]);
        let file = lz4_flex::block::compress_prepend_size(&payload);

        let recording = parse_legacy(&file).unwrap();
        assert_eq!(recording.samples_per_second, 100_000.0);
        assert_eq!(recording.start_system_time, Some(1_600_000_000_000));
        assert_eq!(recording.bits, Some(vec![1, 2, 3]));
        assert!(recording.chart_state.is_none());

        let samples = recording.samples();
        assert_eq!(samples.len(), 3);
        assert!(samples[1].is_placeholder());
        assert_eq!(samples[1].bits, Some(2));
        assert!((samples[2].timestamp_us - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_unversioned_sampling_time() {
        let mut payload = Vec::new();
        block(&mut payload, br#"{"samplingTime":13}"#);
        block(&mut payload, br#"{"windowBegin":0,"windowEnd":0}"#);
        block(&mut payload, &values_block(&[5.0; 10]));
        let file = lz4_flex::block::compress_prepend_size(&payload);

        let recording = parse_legacy(&file).unwrap();
        assert!((recording.samples_per_second - 1_000_000.0 / 13.0).abs() < 1e-6);
        assert_eq!(recording.values.len(), 10);
        assert!(recording.bits.is_none());
        assert!(recording.chart_state.is_some());
        assert!(recording.samples()[0].bits.is_none());
    }

    #[test]
    fn test_missing_rate() {
        let mut payload = Vec::new();
        block(&mut payload, br#"{"version":1,"options":{}}"#);
        block(&mut payload, &values_block(&[1.0]));
        let file = lz4_flex::block::compress_prepend_size(&payload);
        assert!(matches!(parse_legacy(&file), Err(LegacyError::MissingRate)));
    }

    #[test]
    fn test_truncated_and_misaligned() {
        let mut payload = Vec::new();
        block(&mut payload, br#"{"version":1,"options":{"samplesPerSecond":10}}"#);
        payload.extend_from_slice(&100u32.to_le_bytes());
        payload.extend_from_slice(&[0; 8]);
        let file = lz4_flex::block::compress_prepend_size(&payload);
        assert!(matches!(
            parse_legacy(&file),
            Err(LegacyError::Truncated { needed: 100, .. })
        ));

        let mut payload = Vec::new();
        block(&mut payload, br#"{"version":1,"options":{"samplesPerSecond":10}}"#);
        block(&mut payload, &[0; 6]);
        let file = lz4_flex::block::compress_prepend_size(&payload);
        assert!(matches!(
            parse_legacy(&file),
            Err(LegacyError::Misaligned { what: "samples", .. })
        ));
    }

    #[test]
    fn test_missing_samples_block() {
        let mut payload = Vec::new();
        block(&mut payload, br#"{"samplesPerSecond":10}"#);
        let file = lz4_flex::block::compress_prepend_size(&payload);
        assert!(matches!(
            parse_legacy(&file),
            Err(LegacyError::MissingBlock("chart state"))
        ));
    }

    #[test]
    fn test_garbage_input() {
        assert!(parse_legacy(&[16, 0, 0, 0, 0xF0, 0xFF]).is_err());
    }
}
