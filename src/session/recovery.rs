//! Rebuild sidecars for an orphaned session log
//!
//! A log left behind by a crash has no metadata. The rate is inferred from
//! the file size and its birth/modify times by picking the nearest supported
//! rate, then the log is replayed through a fresh folding buffer.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use super::{
    ensure_disk_space, SessionError, SessionMetadata, LOG_FILE, METADATA_FILE, MINIMAP_FILE,
};
use crate::common::{offset_to_index, SampleRecord, RECORD_SIZE};
use crate::config::Config;
use crate::folding::FoldingBuffer;

/// Records read per replay chunk
const REPLAY_CHUNK_RECORDS: usize = 64 * 1024;

/// Rough JSON size of one folding point
const SNAPSHOT_BYTES_PER_POINT: u64 = 64;

/// Outcome of a recovery run
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub session_dir: PathBuf,
    pub samples_per_second: u32,
    pub sample_count: u64,
    pub duration_secs: f64,
    pub start_system_time: i64,
    pub folding_len: usize,
}

/// Nearest supported rate to `total_samples / duration_secs`
pub fn infer_rate(
    total_samples: u64,
    duration_secs: f64,
    rates: &[u32],
) -> Result<u32, SessionError> {
    if !(duration_secs > 0.0) {
        return Err(SessionError::InvalidDuration(duration_secs));
    }
    let observed = total_samples as f64 / duration_secs;
    rates
        .iter()
        .copied()
        .min_by(|a, b| {
            let da = (*a as f64 - observed).abs();
            let db = (*b as f64 - observed).abs();
            da.total_cmp(&db)
        })
        .ok_or(SessionError::NoSupportedRates)
}

/// Replay a log through a new folding buffer
///
/// Returns the buffer and the number of complete records read. Timestamps
/// are `index * period_us`, the same as live acquisition.
pub fn fold_log<R: Read>(
    reader: R,
    period_us: f64,
    max_elements: usize,
) -> io::Result<(FoldingBuffer, u64)> {
    let mut folding = FoldingBuffer::new(max_elements);
    let replayed = replay_log(reader, &mut folding, 0, period_us)?;
    Ok((folding, replayed))
}

/// Replay records into `folding`, the first one being sample `first_index`
///
/// Returns the number of complete records read.
pub fn replay_log<R: Read>(
    mut reader: R,
    folding: &mut FoldingBuffer,
    first_index: u64,
    period_us: f64,
) -> io::Result<u64> {
    let mut buf = vec![0u8; REPLAY_CHUNK_RECORDS * RECORD_SIZE];
    let mut carry = 0usize;
    let mut index = first_index;

    loop {
        let n = match reader.read(&mut buf[carry..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let filled = carry + n;
        let whole = filled / RECORD_SIZE * RECORD_SIZE;
        for record in SampleRecord::decode_all(&buf[..whole]) {
            folding.add_data(record.value(), index as f64 * period_us);
            index += 1;
        }
        buf.copy_within(whole..filled, 0);
        carry = filled - whole;
    }
    if carry > 0 {
        warn!(bytes = carry, "Ignoring trailing partial record");
    }
    Ok(index - first_index)
}

/// Birth time and recording duration of a log file
fn file_times(path: &Path) -> Result<(SystemTime, f64), SessionError> {
    let meta = std::fs::metadata(path)?;
    let created = meta
        .created()
        .map_err(|e| SessionError::MissingTimestamps(format!("birth time: {e}")))?;
    let modified = meta
        .modified()
        .map_err(|e| SessionError::MissingTimestamps(format!("modify time: {e}")))?;
    let duration = match modified.duration_since(created) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    };
    Ok((created, duration))
}

/// Recover the log at `log_path` into a session directory
///
/// The session is written to `out_dir`, or next to the log when `None`;
/// a log outside the target directory is copied in as `session.raw`.
/// `duration_override` replaces the duration derived from file times on
/// filesystems that do not record a birth time.
pub fn recover_log(
    log_path: &Path,
    out_dir: Option<&Path>,
    config: &Config,
    duration_override: Option<f64>,
) -> Result<RecoveryReport, SessionError> {
    let log_len = std::fs::metadata(log_path)?.len();
    let sample_count = offset_to_index(log_len);

    let (start, duration_secs) = match (duration_override, file_times(log_path)) {
        (Some(duration), Ok((created, _))) => (created, duration),
        (Some(duration), Err(e)) => {
            warn!(error = %e, "Using supplied duration without a birth time");
            let start = std::fs::metadata(log_path)?
                .modified()?
                .checked_sub(std::time::Duration::from_secs_f64(duration.max(0.0)))
                .unwrap_or(UNIX_EPOCH);
            (start, duration)
        }
        (None, times) => times?,
    };
    let rate = infer_rate(sample_count, duration_secs, &config.session.supported_rates)?;
    let start_system_time = start
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();
    info!(
        path = %log_path.display(),
        sample_count,
        duration_secs,
        observed_rate = sample_count as f64 / duration_secs,
        rate,
        "Inferred sampling rate"
    );

    let session_dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => log_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    std::fs::create_dir_all(&session_dir)?;
    let target_log = session_dir.join(LOG_FILE);
    let copy_needed = !same_file(log_path, &target_log);

    let max_elements = config.folding.max_elements;
    let snapshot_estimate = max_elements as u64 * 2 * SNAPSHOT_BYTES_PER_POINT + 4096;
    let required = snapshot_estimate + if copy_needed { log_len } else { 0 };
    ensure_disk_space(&session_dir, required)?;

    if copy_needed {
        std::fs::copy(log_path, &target_log)?;
        debug!(to = %target_log.display(), "Copied log into session directory");
    }

    let metadata = SessionMetadata::new(rate as f64, start_system_time);
    let reader = BufReader::new(File::open(&target_log)?);
    let (folding, replayed) = fold_log(reader, metadata.sampling_period_us(), max_elements)?;

    metadata.save(session_dir.join(METADATA_FILE))?;
    std::fs::write(session_dir.join(MINIMAP_FILE), folding.to_json()?)?;
    info!(
        dir = %session_dir.display(),
        samples = replayed,
        slots = folding.len(),
        "Session recovered"
    );

    Ok(RecoveryReport {
        session_dir,
        samples_per_second: rate,
        sample_count: replayed,
        duration_secs,
        start_system_time,
        folding_len: folding.len(),
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SUPPORTED_RATES;
    use tempfile::TempDir;

    fn write_log(path: &Path, n: usize) {
        let mut bytes = Vec::with_capacity(n * RECORD_SIZE);
        for i in 0..n {
            bytes.extend_from_slice(&SampleRecord::new(i as f32, 0).to_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_infer_rate_nearest() {
        // 6_000_000 bytes over 10 s = 100_000 samples/s
        let samples = offset_to_index(6_000_000);
        assert_eq!(infer_rate(samples, 10.0, &SUPPORTED_RATES).unwrap(), 100_000);
        assert_eq!(infer_rate(1_000_000, 10.0, &SUPPORTED_RATES).unwrap(), 100_000);
        assert_eq!(infer_rate(7_000, 10.0, &SUPPORTED_RATES).unwrap(), 1_000);
        assert_eq!(infer_rate(3, 10.0, &SUPPORTED_RATES).unwrap(), 1);
    }

    #[test]
    fn test_infer_rate_bad_duration() {
        assert!(matches!(
            infer_rate(100, 0.0, &SUPPORTED_RATES),
            Err(SessionError::InvalidDuration(_))
        ));
        assert!(matches!(
            infer_rate(100, -1.0, &SUPPORTED_RATES),
            Err(SessionError::InvalidDuration(_))
        ));
        assert!(matches!(
            infer_rate(100, 1.0, &[]),
            Err(SessionError::NoSupportedRates)
        ));
    }

    #[test]
    fn test_fold_log_matches_live_folding() {
        let mut bytes = Vec::new();
        let mut live = FoldingBuffer::new(16);
        for i in 0..1000u32 {
            let record = if i % 7 == 0 {
                SampleRecord::placeholder()
            } else {
                SampleRecord::new((i % 50) as f32, 0)
            };
            bytes.extend_from_slice(&record.to_bytes());
            live.add_data(record.value(), i as f64 * 10.0);
        }
        // trailing partial record is ignored
        bytes.extend_from_slice(&[1, 2, 3]);

        // one-byte reads exercise the carry across chunks
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0.is_empty() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0[0];
                self.0 = &self.0[1..];
                Ok(1)
            }
        }

        let (folded, count) = fold_log(&bytes[..], 10.0, 16).unwrap();
        assert_eq!(count, 1000);
        assert_eq!(folded, live);

        let (trickled, count) = fold_log(Trickle(&bytes), 10.0, 16).unwrap();
        assert_eq!(count, 1000);
        assert_eq!(trickled, live);
    }

    #[test]
    fn test_replay_resumes_partial_pyramid() {
        let records: Vec<SampleRecord> = (0..700u32)
            .map(|i| SampleRecord::new((i % 90) as f32, 0))
            .collect();
        let bytes: Vec<u8> = records.iter().flat_map(|r| r.to_bytes()).collect();
        let (whole, _) = fold_log(&bytes[..], 10.0, 32).unwrap();

        // 413 is not a slot boundary once the pyramid has folded
        let split = 413 * RECORD_SIZE;
        let (mut resumed, head) = fold_log(&bytes[..split], 10.0, 32).unwrap();
        assert_eq!(resumed.sample_count(), head);
        let tail = replay_log(&bytes[split..], &mut resumed, head, 10.0).unwrap();
        assert_eq!(head + tail, 700);
        assert_eq!(resumed, whole);
    }

    #[test]
    fn test_recover_with_duration_override() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("orphan.raw");
        write_log(&log, 5_000);

        let mut config = Config::default();
        config.folding.max_elements = 32;
        let out = dir.path().join("recovered");
        let report = recover_log(&log, Some(&out), &config, Some(5.0)).unwrap();

        assert_eq!(report.samples_per_second, 1_000);
        assert_eq!(report.sample_count, 5_000);
        assert!(report.folding_len <= 32);
        assert!(out.join(LOG_FILE).exists());

        let metadata = SessionMetadata::load(out.join(METADATA_FILE)).unwrap();
        assert_eq!(metadata.samples_per_second, 1_000.0);
        let json = std::fs::read_to_string(out.join(MINIMAP_FILE)).unwrap();
        let folding = FoldingBuffer::from_json(&json).unwrap();
        assert_eq!(folding.len(), report.folding_len);
    }

    #[test]
    fn test_recover_in_place() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join(LOG_FILE);
        write_log(&log, 100);

        let report = recover_log(&log, None, &Config::default(), Some(1.0)).unwrap();
        assert_eq!(report.samples_per_second, 100);
        assert_eq!(report.session_dir, dir.path());
        assert!(dir.path().join(METADATA_FILE).exists());
        assert_eq!(std::fs::metadata(&log).unwrap().len(), 600);
    }
}
