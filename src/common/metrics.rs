//! Acquisition metrics
//!
//! # Design Principles (KISS)
//! - Lock-free atomic counters for hot path (zero overhead on data path)
//! - Simple snapshot mechanism for reporting
//! - Shared between the decode path, the storage queues and the reporter

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracked by one acquisition session
///
/// All operations use Relaxed ordering for maximum performance.
/// Statistics are eventually consistent, which is acceptable for monitoring.
#[derive(Debug, Default)]
pub struct AcquisitionCounters {
    /// Samples emitted by the decoder (placeholders included)
    pub samples_decoded: AtomicU64,
    /// Placeholder samples emitted for lost or undecodable frames
    pub placeholder_samples: AtomicU64,
    /// Samples reported missing by the rolling counter
    pub samples_lost: AtomicU64,
    /// Out-of-sequence frames replayed after resynchronization
    pub frames_replayed: AtomicU64,
    /// Bytes copied into write pages
    pub bytes_appended: AtomicU64,
    /// Bytes flushed to the log file
    pub bytes_flushed: AtomicU64,
    /// Reads served from resident pages
    pub read_hits: AtomicU64,
    /// Reads that went to disk
    pub read_misses: AtomicU64,
    /// Disk tasks dropped after exhausting retries
    pub failed_io_tasks: AtomicU64,
}

impl AcquisitionCounters {
    /// Create new zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_samples(&self, n: u64) {
        self.samples_decoded.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_placeholders(&self, n: u64) {
        self.placeholder_samples.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_lost(&self, n: u64) {
        self.samples_lost.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_replayed(&self, n: u64) {
        self.frames_replayed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_appended(&self, n: u64) {
        self.bytes_appended.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_flushed(&self, n: u64) {
        self.bytes_flushed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_read_hit(&self) {
        self.read_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_read_miss(&self) {
        self.read_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_failed_io(&self) {
        self.failed_io_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            samples_decoded: self.samples_decoded.load(Ordering::Relaxed),
            placeholder_samples: self.placeholder_samples.load(Ordering::Relaxed),
            samples_lost: self.samples_lost.load(Ordering::Relaxed),
            frames_replayed: self.frames_replayed.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            read_hits: self.read_hits.load(Ordering::Relaxed),
            read_misses: self.read_misses.load(Ordering::Relaxed),
            failed_io_tasks: self.failed_io_tasks.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of counter values at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub samples_decoded: u64,
    pub placeholder_samples: u64,
    pub samples_lost: u64,
    pub frames_replayed: u64,
    pub bytes_appended: u64,
    pub bytes_flushed: u64,
    pub read_hits: u64,
    pub read_misses: u64,
    pub failed_io_tasks: u64,
}

impl CounterSnapshot {
    /// Samples per second between two snapshots
    pub fn sample_rate_from(&self, prev: &CounterSnapshot, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.samples_decoded.saturating_sub(prev.samples_decoded) as f64 / elapsed_secs
    }

    /// Bytes not yet flushed to disk
    pub fn pending_bytes(&self) -> u64 {
        self.bytes_appended.saturating_sub(self.bytes_flushed)
    }

    /// Fraction of reads served from memory
    pub fn hit_ratio(&self) -> f64 {
        let total = self.read_hits + self.read_misses;
        if total == 0 {
            return 0.0;
        }
        self.read_hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_new() {
        let counters = AcquisitionCounters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_add_methods() {
        let counters = AcquisitionCounters::new();
        counters.add_samples(100);
        counters.add_placeholders(3);
        counters.add_lost(3);
        counters.add_appended(600);
        counters.add_flushed(400);
        counters.inc_read_hit();
        counters.inc_read_miss();

        let snap = counters.snapshot();
        assert_eq!(snap.samples_decoded, 100);
        assert_eq!(snap.placeholder_samples, 3);
        assert_eq!(snap.samples_lost, 3);
        assert_eq!(snap.pending_bytes(), 200);
        assert!((snap.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sample_rate() {
        let prev = CounterSnapshot::default();
        let current = CounterSnapshot {
            samples_decoded: 200_000,
            ..Default::default()
        };
        assert_eq!(current.sample_rate_from(&prev, 2.0), 100_000.0);
        assert_eq!(current.sample_rate_from(&prev, 0.0), 0.0);
    }
}
