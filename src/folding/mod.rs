//! Folding buffer - bounded-memory min/max pyramid of the whole recording
//!
//! Each slot aggregates `number_of_times_to_fold` consecutive samples into
//! a running minimum, maximum and mean timestamp. When the slot arrays are
//! full, adjacent slots are merged pairwise: the length halves and every
//! later slot covers twice as many samples. Memory stays at
//! `2 * max_number_of_elements` points however long the stream runs.
//!
//! The buffer is its own snapshot format (`minimap.json`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoder::SampleEvent;

/// Default slot capacity
pub const DEFAULT_MAX_ELEMENTS: usize = 10_000;

/// Folding snapshot errors
#[derive(Error, Debug)]
pub enum FoldingError {
    #[error("Snapshot parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Inconsistent snapshot: {0}")]
    Inconsistent(String),
}

/// One aggregated point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Mean timestamp of the slot in microseconds
    pub x: f64,
    /// Extreme value, `None` until a sample with a value lands in the slot
    pub y: Option<f32>,
}

/// Parallel min/max slot arrays
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMax {
    pub min: Vec<Point>,
    pub max: Vec<Point>,
}

/// Min/max decimation pyramid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldingBuffer {
    last_element_fold_count: u32,
    data: MinMax,
    max_number_of_elements: usize,
    number_of_times_to_fold: u32,
}

impl Default for FoldingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ELEMENTS)
    }
}

impl FoldingBuffer {
    /// `max_elements` must be even and at least 2
    pub fn new(max_elements: usize) -> Self {
        debug_assert!(max_elements >= 2 && max_elements % 2 == 0);
        Self {
            last_element_fold_count: 0,
            data: MinMax {
                min: Vec::with_capacity(max_elements),
                max: Vec::with_capacity(max_elements),
            },
            max_number_of_elements: max_elements,
            number_of_times_to_fold: 1,
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.data.min.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.min.is_empty()
    }

    pub fn max_number_of_elements(&self) -> usize {
        self.max_number_of_elements
    }

    /// Samples aggregated by each slot at the current resolution
    pub fn number_of_times_to_fold(&self) -> u32 {
        self.number_of_times_to_fold
    }

    pub fn last_element_fold_count(&self) -> u32 {
        self.last_element_fold_count
    }

    /// Number of samples aggregated so far
    ///
    /// Every slot but the last holds `number_of_times_to_fold` samples.
    pub fn sample_count(&self) -> u64 {
        let per_slot = u64::from(self.number_of_times_to_fold);
        match self.len() as u64 {
            0 => 0,
            n => {
                let last = match self.last_element_fold_count {
                    0 => per_slot,
                    partial => u64::from(partial),
                };
                (n - 1) * per_slot + last
            }
        }
    }

    pub fn data(&self) -> &MinMax {
        &self.data
    }

    /// Add one sample; a missing value only advances time
    pub fn add_data(&mut self, value: Option<f32>, timestamp_us: f64) {
        if self.last_element_fold_count == 0 {
            if self.data.min.len() >= self.max_number_of_elements {
                self.fold();
            }
            self.data.min.push(Point {
                x: timestamp_us,
                y: value,
            });
            self.data.max.push(Point {
                x: timestamp_us,
                y: value,
            });
            self.last_element_fold_count = 1;
        } else {
            self.last_element_fold_count += 1;
            let alpha = 1.0 / self.last_element_fold_count as f64;
            if let (Some(min), Some(max)) = (self.data.min.last_mut(), self.data.max.last_mut()) {
                min.x = timestamp_us * alpha + min.x * (1.0 - alpha);
                max.x = timestamp_us * alpha + max.x * (1.0 - alpha);
                if let Some(v) = value {
                    min.y = Some(min.y.map_or(v, |m| m.min(v)));
                    max.y = Some(max.y.map_or(v, |m| m.max(v)));
                }
            }
        }

        if self.last_element_fold_count >= self.number_of_times_to_fold {
            self.last_element_fold_count = 0;
        }
    }

    /// Add a decoded sample
    pub fn add_sample(&mut self, sample: &SampleEvent) {
        self.add_data(sample.value, sample.timestamp_us);
    }

    /// Merge adjacent slots pairwise, halving the length
    pub fn fold(&mut self) {
        let half = self.data.min.len() / 2;
        for i in 0..half {
            let (a, b) = (self.data.min[2 * i], self.data.min[2 * i + 1]);
            self.data.min[i] = Point {
                x: (a.x + b.x) / 2.0,
                y: merge(a.y, b.y, f32::min),
            };
            let (a, b) = (self.data.max[2 * i], self.data.max[2 * i + 1]);
            self.data.max[i] = Point {
                x: (a.x + b.x) / 2.0,
                y: merge(a.y, b.y, f32::max),
            };
        }
        self.data.min.truncate(half);
        self.data.max.truncate(half);
        self.number_of_times_to_fold *= 2;
    }

    /// Min and max points interleaved, `y = None` for slots never populated
    pub fn get_data(&self) -> Vec<Point> {
        let mut out = Vec::with_capacity(self.len() * 2);
        for (min, max) in self.data.min.iter().zip(&self.data.max) {
            let valid = matches!((min.y, max.y), (Some(lo), Some(hi)) if hi >= lo);
            let y = |p: &Point| if valid { p.y } else { None };
            out.push(Point { x: min.x, y: y(min) });
            out.push(Point { x: max.x, y: y(max) });
        }
        out
    }

    pub fn to_json(&self) -> Result<String, FoldingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore from a snapshot, rejecting inconsistent ones
    pub fn from_json(json: &str) -> Result<Self, FoldingError> {
        let buffer: FoldingBuffer = serde_json::from_str(json)?;
        buffer.check()?;
        Ok(buffer)
    }

    fn check(&self) -> Result<(), FoldingError> {
        if self.data.min.len() != self.data.max.len() {
            return Err(FoldingError::Inconsistent(format!(
                "min has {} slots, max has {}",
                self.data.min.len(),
                self.data.max.len()
            )));
        }
        if self.max_number_of_elements < 2 || self.max_number_of_elements % 2 != 0 {
            return Err(FoldingError::Inconsistent(format!(
                "maxNumberOfElements {} is not an even number >= 2",
                self.max_number_of_elements
            )));
        }
        if self.data.min.len() > self.max_number_of_elements {
            return Err(FoldingError::Inconsistent(
                "more slots than maxNumberOfElements".to_string(),
            ));
        }
        if self.number_of_times_to_fold == 0
            || self.last_element_fold_count >= self.number_of_times_to_fold
        {
            return Err(FoldingError::Inconsistent(
                "fold counters out of range".to_string(),
            ));
        }
        Ok(())
    }
}

fn merge(a: Option<f32>, b: Option<f32>, pick: fn(f32, f32) -> f32) -> Option<f32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_invariants(buffer: &FoldingBuffer) {
        let data = buffer.data();
        assert_eq!(data.min.len(), data.max.len());
        assert!(data.min.len() <= buffer.max_number_of_elements());
        for (lo, hi) in data.min.iter().zip(&data.max) {
            if let (Some(lo), Some(hi)) = (lo.y, hi.y) {
                assert!(hi >= lo);
            }
        }
    }

    #[test]
    fn test_single_fold_of_small_buffer() {
        let mut buffer = FoldingBuffer::new(4);
        for i in 0..8 {
            buffer.add_data(Some(i as f32), i as f64 * 10.0);
        }
        assert_eq!(buffer.number_of_times_to_fold(), 2);
        assert_eq!(buffer.get_data().len(), 8);
        assert_invariants(&buffer);

        // first slot after the fold covers samples 0 and 1
        let data = buffer.data();
        assert_eq!(data.min[0].y, Some(0.0));
        assert_eq!(data.max[0].y, Some(1.0));
        assert!((data.min[0].x - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_fold_halves_and_doubles() {
        let mut buffer = FoldingBuffer::new(8);
        for i in 0..8 {
            buffer.add_data(Some(i as f32), i as f64);
        }
        assert_eq!(buffer.len(), 8);
        buffer.fold();
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.number_of_times_to_fold(), 2);
        assert_invariants(&buffer);
    }

    #[test]
    fn test_random_stream_keeps_invariants() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut buffer = FoldingBuffer::new(64);
        for i in 0..100_000u32 {
            let value = if rng.gen_bool(0.01) {
                None
            } else {
                Some(rng.gen_range(-1000.0f32..1000.0))
            };
            buffer.add_data(value, i as f64 * 10.0);
            if i % 997 == 0 {
                assert_invariants(&buffer);
            }
        }
        assert_invariants(&buffer);
        assert!(buffer.len() > 32);
        // 100k samples into 64 slots needs folds up to 2048 samples per slot
        assert_eq!(buffer.number_of_times_to_fold(), 2048);
    }

    #[test]
    fn test_sample_count_across_folds() {
        let mut buffer = FoldingBuffer::new(8);
        assert_eq!(buffer.sample_count(), 0);
        for i in 0..1_000u64 {
            buffer.add_data(Some(1.0), i as f64);
            assert_eq!(buffer.sample_count(), i + 1, "after sample {i}");
        }
        assert!(buffer.number_of_times_to_fold() > 1);
    }

    #[test]
    fn test_running_mean_timestamp() {
        let mut buffer = FoldingBuffer::new(4);
        buffer.number_of_times_to_fold = 4;
        for t in [0.0, 10.0, 20.0, 30.0] {
            buffer.add_data(Some(1.0), t);
        }
        assert_eq!(buffer.len(), 1);
        assert!((buffer.data().min[0].x - 15.0).abs() < 1e-9);
        assert_eq!(buffer.last_element_fold_count(), 0);
    }

    #[test]
    fn test_empty_slot_is_invalid() {
        let mut buffer = FoldingBuffer::new(4);
        buffer.add_data(None, 0.0);
        buffer.add_data(Some(3.0), 10.0);

        let data = buffer.get_data();
        assert_eq!(data.len(), 4);
        assert_eq!(data[0].y, None);
        assert_eq!(data[1].y, None);
        assert_eq!(data[2].y, Some(3.0));
        assert_eq!(data[3].y, Some(3.0));
    }

    #[test]
    fn test_missing_values_merge_into_slot() {
        let mut buffer = FoldingBuffer::new(4);
        buffer.number_of_times_to_fold = 3;
        buffer.add_data(None, 0.0);
        buffer.add_data(Some(5.0), 1.0);
        buffer.add_data(Some(2.0), 2.0);
        assert_eq!(buffer.data().min[0].y, Some(2.0));
        assert_eq!(buffer.data().max[0].y, Some(5.0));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut buffer = FoldingBuffer::new(4);
        for i in 0..11 {
            buffer.add_data(Some(i as f32), i as f64);
        }
        let json = buffer.to_json().unwrap();
        assert!(json.contains("\"lastElementFoldCount\""));
        assert!(json.contains("\"maxNumberOfElements\":4"));
        assert!(json.contains("\"numberOfTimesToFold\""));

        let restored = FoldingBuffer::from_json(&json).unwrap();
        assert_eq!(restored, buffer);
    }

    #[test]
    fn test_inconsistent_snapshot_rejected() {
        let json = r#"{"lastElementFoldCount":0,"data":{"min":[{"x":0.0,"y":1.0}],"max":[]},"maxNumberOfElements":4,"numberOfTimesToFold":1}"#;
        assert!(matches!(
            FoldingBuffer::from_json(json),
            Err(FoldingError::Inconsistent(_))
        ));
    }
}
