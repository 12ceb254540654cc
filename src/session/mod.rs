//! Session context - one recording on disk
//!
//! A session directory holds:
//! - `session.raw`: the sample log, 6-byte records at a fixed rate
//! - `metadata.json`: `{samplesPerSecond, startSystemTime, formatVersion}`
//! - `minimap.json`: folding buffer snapshot for fast resume
//!
//! The session owns the paged log and the folding buffer. It is created on
//! acquisition start (or file open) and consumed by [`Session::close`],
//! which flushes, fsyncs and writes both sidecars.

pub mod format;
pub mod legacy;
pub mod recovery;

pub use format::{
    ContainerFooter, ContainerHeader, ContainerReader, ContainerValidation, FileFormatError,
    Section,
};
pub use legacy::{LegacyError, LegacyRecording};
pub use recovery::{fold_log, infer_rate, recover_log, replay_log, RecoveryReport};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::{
    index_to_offset, offset_to_index, sampling_period_us, unix_time_ms, AcquisitionCounters,
    SampleRecord, RECORD_SIZE,
};
use crate::config::Config;
use crate::decoder::SampleEvent;
use crate::folding::{FoldingBuffer, FoldingError};
use crate::storage::{PagedLog, StorageError};

/// Log file name inside a session directory
pub const LOG_FILE: &str = "session.raw";

/// Metadata sidecar file name
pub const METADATA_FILE: &str = "metadata.json";

/// Folding snapshot sidecar file name
pub const MINIMAP_FILE: &str = "minimap.json";

/// Sidecar format version written by this crate
pub const FORMAT_VERSION: u32 = 2;

/// Rates a probe can run at, in samples per second
pub const SUPPORTED_RATES: [u32; 7] = [100_000, 50_000, 10_000, 1_000, 100, 10, 1];

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Folding snapshot error: {0}")]
    Folding(#[from] FoldingError),

    #[error("Container error: {0}")]
    Format(#[from] FileFormatError),

    #[error("Legacy file error: {0}")]
    Legacy(#[from] LegacyError),

    #[error("Insufficient disk space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Recording duration must be positive, got {0} s")]
    InvalidDuration(f64),

    #[error("No supported sampling rates configured")]
    NoSupportedRates,

    #[error("Invalid container: {0}")]
    InvalidContainer(String),

    #[error("File timestamps unavailable: {0}")]
    MissingTimestamps(String),

    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Sidecar metadata of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub samples_per_second: f64,
    /// Unix milliseconds at the first sample
    pub start_system_time: i64,
    pub format_version: u32,
}

impl SessionMetadata {
    pub fn new(samples_per_second: f64, start_system_time: i64) -> Self {
        Self {
            samples_per_second,
            start_system_time,
            format_version: FORMAT_VERSION,
        }
    }

    pub fn sampling_period_us(&self) -> f64 {
        sampling_period_us(self.samples_per_second)
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.start_system_time)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SessionError> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// One recording: log, folding buffer and sidecars
#[derive(Debug)]
pub struct Session {
    dir: PathBuf,
    metadata: SessionMetadata,
    log: PagedLog,
    folding: FoldingBuffer,
    sample_count: u64,
    period_us: f64,
}

impl Session {
    /// Start a new session in `dir` at the configured rate
    pub async fn create<P: AsRef<Path>>(
        dir: P,
        config: &Config,
        counters: Arc<AcquisitionCounters>,
    ) -> Result<Self, SessionError> {
        let metadata = SessionMetadata::new(config.session.samples_per_second, unix_time_ms());
        Self::create_with_metadata(dir, metadata, config, counters).await
    }

    /// Start a new session with explicit metadata (imports)
    pub async fn create_with_metadata<P: AsRef<Path>>(
        dir: P,
        metadata: SessionMetadata,
        config: &Config,
        counters: Arc<AcquisitionCounters>,
    ) -> Result<Self, SessionError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        metadata.save(dir.join(METADATA_FILE))?;

        let log = PagedLog::create(dir.join(LOG_FILE), &config.storage, counters).await?;
        info!(
            dir = %dir.display(),
            samples_per_second = metadata.samples_per_second,
            "Session created"
        );
        Ok(Self {
            period_us: metadata.sampling_period_us(),
            dir,
            metadata,
            log,
            folding: FoldingBuffer::new(config.folding.max_elements),
            sample_count: 0,
        })
    }

    /// Resume a session from its directory
    ///
    /// A torn record at the end of the log is cut off before appending
    /// resumes. The folding buffer comes from `minimap.json` when the
    /// snapshot covers every sample in the log; a snapshot that lags behind
    /// is caught up from the log tail, and a missing, unreadable or
    /// inconsistent one is rebuilt by replaying the whole log.
    pub async fn open<P: AsRef<Path>>(
        dir: P,
        config: &Config,
        counters: Arc<AcquisitionCounters>,
    ) -> Result<Self, SessionError> {
        let dir = dir.as_ref().to_path_buf();
        let metadata = SessionMetadata::load(dir.join(METADATA_FILE))?;
        let log_path = dir.join(LOG_FILE);
        truncate_partial_record(&log_path).await?;
        let log = PagedLog::open(&log_path, &config.storage, counters).await?;
        let sample_count = offset_to_index(log.len());
        let period_us = metadata.sampling_period_us();

        let minimap = dir.join(MINIMAP_FILE);
        let snapshot = match tokio::fs::read_to_string(&minimap).await {
            Ok(json) => match FoldingBuffer::from_json(&json) {
                Ok(folding) => Some(folding),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable minimap");
                    None
                }
            },
            Err(e) => {
                debug!(error = %e, "No minimap snapshot");
                None
            }
        };

        let folding = match snapshot {
            Some(folding) if folding.sample_count() == sample_count => folding,
            Some(folding) if folding.sample_count() < sample_count => {
                let covered = folding.sample_count();
                warn!(covered, sample_count, "Minimap lags behind the log, replaying tail");
                replay_range(log_path, folding, covered, sample_count, period_us).await?
            }
            other => {
                if let Some(stale) = other {
                    warn!(
                        covered = stale.sample_count(),
                        sample_count,
                        "Minimap covers more than the log, rebuilding"
                    );
                }
                let empty = FoldingBuffer::new(config.folding.max_elements);
                replay_range(log_path, empty, 0, sample_count, period_us).await?
            }
        };

        info!(dir = %dir.display(), sample_count, "Session opened");
        Ok(Self {
            dir,
            metadata,
            log,
            folding,
            sample_count,
            period_us,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn folding(&self) -> &FoldingBuffer {
        &self.folding
    }

    pub fn log(&self) -> &PagedLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut PagedLog {
        &mut self.log
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn sampling_period_us(&self) -> f64 {
        self.period_us
    }

    /// Recording length in microseconds
    pub fn duration_us(&self) -> f64 {
        self.sample_count as f64 * self.period_us
    }

    /// Append one sample to the log and the folding buffer
    pub fn append_sample(&mut self, sample: &SampleEvent) {
        self.log.append(&sample.to_record().to_bytes());
        self.fold(sample.value);
    }

    /// Append a batch of samples with a single log append
    pub fn append_samples(&mut self, samples: &[SampleEvent]) {
        let mut bytes = Vec::with_capacity(samples.len() * RECORD_SIZE);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_record().to_bytes());
        }
        self.log.append(&bytes);
        for sample in samples {
            self.fold(sample.value);
        }
    }

    fn fold(&mut self, value: Option<f32>) {
        let timestamp_us = self.sample_count as f64 * self.period_us;
        self.folding.add_data(value, timestamp_us);
        self.sample_count += 1;
    }

    /// Raw bytes of the log
    pub async fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, SessionError> {
        Ok(self.log.read(offset, len).await?)
    }

    /// Up to `count` records starting at sample `index`
    pub async fn read_samples(
        &mut self,
        index: u64,
        count: u64,
    ) -> Result<Vec<SampleRecord>, SessionError> {
        let end = (index + count).min(self.sample_count);
        if index >= end {
            return Ok(Vec::new());
        }
        let offset = index_to_offset(index);
        let len = index_to_offset(end - index) as usize;
        let bytes = self.log.read(offset, len).await?;
        Ok(SampleRecord::decode_all(&bytes))
    }

    /// Disk failures reported since the last call
    pub fn take_errors(&mut self) -> Vec<StorageError> {
        self.log.take_errors()
    }

    /// Flush the log and rewrite both sidecars
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        self.log.flush().await?;
        self.write_sidecars()
    }

    fn write_sidecars(&self) -> Result<(), SessionError> {
        self.metadata.save(self.dir.join(METADATA_FILE))?;
        std::fs::write(self.dir.join(MINIMAP_FILE), self.folding.to_json()?)?;
        debug!(dir = %self.dir.display(), "Sidecars written");
        Ok(())
    }

    /// Flush, fsync and release the log, then write the sidecars
    pub async fn close(self) -> Result<(), SessionError> {
        let Session {
            dir,
            metadata,
            log,
            folding,
            sample_count,
            ..
        } = self;
        let closed = log.close().await;

        metadata.save(dir.join(METADATA_FILE))?;
        std::fs::write(dir.join(MINIMAP_FILE), folding.to_json()?)?;
        info!(dir = %dir.display(), sample_count, "Session closed");
        closed.map_err(SessionError::from)
    }

    /// Write the session into a single export container
    pub async fn export<P: AsRef<Path>>(&mut self, path: P) -> Result<ContainerFooter, SessionError> {
        self.flush().await?;
        let path = path.as_ref().to_path_buf();
        let metadata_json = serde_json::to_vec(&self.metadata)?;
        let minimap_json = self.folding.to_json()?.into_bytes();
        let log_len = self.log.len();

        let required = log_len + (metadata_json.len() + minimap_json.len()) as u64 + 1024;
        ensure_disk_space(&path, required)?;

        let header = ContainerHeader {
            version: format::CONTAINER_VERSION,
            format_version: self.metadata.format_version,
            samples_per_second: self.metadata.samples_per_second,
            start_system_time: self.metadata.start_system_time,
            sample_count: self.sample_count,
        };
        let log_path = self.dir.join(LOG_FILE);
        let out = path.clone();
        let footer = tokio::task::spawn_blocking(move || -> Result<ContainerFooter, SessionError> {
            let mut log = BufReader::new(File::open(log_path)?).take(log_len);
            let mut writer = BufWriter::new(File::create(out)?);
            Ok(format::write_container(
                &mut writer,
                &header,
                &metadata_json,
                &minimap_json,
                &mut log,
                log_len,
            )?)
        })
        .await??;

        info!(path = %path.display(), bytes = log_len, "Session exported");
        Ok(footer)
    }

    /// Unpack an export container into `dir` and open it
    pub async fn import<P: AsRef<Path>, Q: AsRef<Path>>(
        container: P,
        dir: Q,
        config: &Config,
        counters: Arc<AcquisitionCounters>,
    ) -> Result<Self, SessionError> {
        let container = container.as_ref().to_path_buf();
        let target = dir.as_ref().to_path_buf();
        let out = target.clone();

        tokio::task::spawn_blocking(move || -> Result<(), SessionError> {
            let mut reader = ContainerReader::new(BufReader::new(File::open(&container)?))?;
            let validation = reader.validate();
            if !validation.is_valid {
                return Err(SessionError::InvalidContainer(validation.errors.join("; ")));
            }
            let required: u64 = validation.section_lengths.iter().sum();
            std::fs::create_dir_all(&out)?;
            ensure_disk_space(&out, required)?;

            for section in [Section::Metadata, Section::Minimap, Section::Log] {
                let mut writer = BufWriter::new(File::create(out.join(section.file_name()))?);
                reader.copy_section(section, &mut writer)?;
                writer.flush()?;
            }
            Ok(())
        })
        .await??;

        info!(dir = %target.display(), "Container imported");
        Self::open(target, config, counters).await
    }

    /// Convert a legacy single-stream file into a new session in `dir`
    pub async fn import_legacy<P: AsRef<Path>, Q: AsRef<Path>>(
        file: P,
        dir: Q,
        config: &Config,
        counters: Arc<AcquisitionCounters>,
    ) -> Result<Self, SessionError> {
        let file = file.as_ref().to_path_buf();
        let recording = tokio::task::spawn_blocking(move || legacy::load_legacy(file)).await??;

        let required = recording.values.len() as u64 * RECORD_SIZE as u64;
        let target = dir.as_ref();
        std::fs::create_dir_all(target)?;
        ensure_disk_space(target, required)?;

        let metadata = SessionMetadata::new(
            recording.samples_per_second,
            recording.start_system_time.unwrap_or_else(unix_time_ms),
        );
        let mut session = Self::create_with_metadata(target, metadata, config, counters).await?;
        let samples = recording.samples();
        for chunk in samples.chunks(4096) {
            session.append_samples(chunk);
        }
        session.flush().await?;
        info!(
            dir = %target.display(),
            samples = session.sample_count(),
            "Legacy file imported"
        );
        Ok(session)
    }
}

/// Cut a torn trailing record so appends stay record-aligned
async fn truncate_partial_record(path: &Path) -> Result<(), SessionError> {
    let len = tokio::fs::metadata(path).await?.len();
    let aligned = index_to_offset(offset_to_index(len));
    if aligned != len {
        warn!(
            path = %path.display(),
            len,
            dropped = len - aligned,
            "Log ends with a partial record, truncating"
        );
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(aligned).await?;
        file.sync_all().await?;
    }
    Ok(())
}

/// Fold records `[from, to)` of the log into `folding`
async fn replay_range(
    log_path: PathBuf,
    mut folding: FoldingBuffer,
    from: u64,
    to: u64,
    period_us: f64,
) -> Result<FoldingBuffer, SessionError> {
    let folding = tokio::task::spawn_blocking(move || {
        let mut file = File::open(log_path)?;
        file.seek(SeekFrom::Start(index_to_offset(from)))?;
        let reader = BufReader::new(file.take(index_to_offset(to - from)));
        recovery::replay_log(reader, &mut folding, from, period_us)?;
        Ok::<_, std::io::Error>(folding)
    })
    .await??;
    Ok(folding)
}

/// Free bytes on the filesystem holding `path`
///
/// `path` need not exist; its closest existing ancestor is used.
pub fn available_space(path: &Path) -> Option<u64> {
    let existing = path.ancestors().find(|p| p.exists())?;
    let canonical = std::fs::canonicalize(existing).ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Fail early when `required` bytes will not fit next to `path`
pub fn ensure_disk_space(path: &Path, required: u64) -> Result<(), SessionError> {
    let verdict = check_space(required, available_space(path));
    if verdict.is_err() {
        warn!(required, path = %path.display(), "Insufficient disk space");
    }
    verdict
}

/// An unknown amount of free space lets the operation go ahead
fn check_space(required: u64, available: Option<u64>) -> Result<(), SessionError> {
    match available {
        Some(available) if available < required => Err(SessionError::InsufficientSpace {
            required,
            available,
        }),
        Some(available) => {
            debug!(required, available, "Disk space check passed");
            Ok(())
        }
        None => {
            warn!(required, "Could not determine free disk space");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.session.samples_per_second = 1000.0;
        config.storage.page_size = 60;
        config.storage.write_pages = 2;
        config.storage.read_pages = 4;
        config.folding.max_elements = 8;
        config
    }

    fn samples(n: usize) -> Vec<SampleEvent> {
        (0..n)
            .map(|i| {
                if i % 10 == 9 {
                    SampleEvent::placeholder(0.0)
                } else {
                    SampleEvent::new(i as f32, Some(i as u16), 0.0)
                }
            })
            .collect()
    }

    #[test]
    fn test_metadata_json_names() {
        let metadata = SessionMetadata::new(100_000.0, 1_700_000_000_000);
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"samplesPerSecond\":100000.0"));
        assert!(json.contains("\"startSystemTime\":1700000000000"));
        assert!(json.contains("\"formatVersion\":2"));
        assert_eq!(metadata.start_time().unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_create_append_read() {
        let dir = TempDir::new().unwrap();
        let counters = Arc::new(AcquisitionCounters::new());
        let mut session = Session::create(dir.path().join("s"), &small_config(), counters)
            .await
            .unwrap();

        let input = samples(100);
        session.append_samples(&input[..40]);
        for sample in &input[40..] {
            session.append_sample(sample);
        }
        assert_eq!(session.sample_count(), 100);
        assert!((session.duration_us() - 100_000.0).abs() < 1e-6);
        session.flush().await.unwrap();

        let records = session.read_samples(5, 10).await.unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[0].value(), Some(5.0));
        assert_eq!(records[4].value(), None);
        assert_eq!({ records[3].bits }, 8);

        // reading past the end is clamped
        assert_eq!(session.read_samples(95, 50).await.unwrap().len(), 5);
        assert!(session.take_errors().is_empty());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_restores_folding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s");
        let config = small_config();

        let mut session = Session::create(&path, &config, Arc::new(AcquisitionCounters::new()))
            .await
            .unwrap();
        session.append_samples(&samples(50));
        let folding = session.folding().clone();
        session.close().await.unwrap();

        let reopened = Session::open(&path, &config, Arc::new(AcquisitionCounters::new()))
            .await
            .unwrap();
        assert_eq!(reopened.sample_count(), 50);
        assert_eq!(reopened.folding(), &folding);
        assert_eq!(reopened.metadata().samples_per_second, 1000.0);
        reopened.close().await.unwrap();

        // without the snapshot the log is replayed into the same pyramid
        std::fs::remove_file(path.join(MINIMAP_FILE)).unwrap();
        let rebuilt = Session::open(&path, &config, Arc::new(AcquisitionCounters::new()))
            .await
            .unwrap();
        assert_eq!(rebuilt.folding(), &folding);
        rebuilt.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = small_config();

        let mut session =
            Session::create(dir.path().join("a"), &config, Arc::new(AcquisitionCounters::new()))
                .await
                .unwrap();
        session.append_samples(&samples(30));
        let container = dir.path().join("a.ppk");
        let footer = session.export(&container).await.unwrap();
        assert_eq!(footer.sample_count, 30);
        assert!(footer.is_complete());
        let metadata = session.metadata().clone();
        session.close().await.unwrap();

        let mut imported = Session::import(
            &container,
            dir.path().join("b"),
            &config,
            Arc::new(AcquisitionCounters::new()),
        )
        .await
        .unwrap();
        assert_eq!(imported.metadata(), &metadata);
        assert_eq!(imported.sample_count(), 30);
        let records = imported.read_samples(0, 30).await.unwrap();
        assert_eq!(records[29].value(), None);
        assert_eq!(records[28].value(), Some(28.0));
        imported.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_import_rejects_corrupt_container() {
        let dir = TempDir::new().unwrap();
        let config = small_config();

        let mut session =
            Session::create(dir.path().join("a"), &config, Arc::new(AcquisitionCounters::new()))
                .await
                .unwrap();
        session.append_samples(&samples(30));
        let container = dir.path().join("a.ppk");
        session.export(&container).await.unwrap();
        session.close().await.unwrap();

        let mut bytes = std::fs::read(&container).unwrap();
        let n = bytes.len();
        bytes[n - format::FOOTER_SIZE - 1] ^= 0x55;
        std::fs::write(&container, bytes).unwrap();

        let result = Session::import(
            &container,
            dir.path().join("b"),
            &config,
            Arc::new(AcquisitionCounters::new()),
        )
        .await;
        assert!(matches!(result, Err(SessionError::InvalidContainer(_))));
    }

    #[test]
    fn test_disk_space_check() {
        assert!(matches!(
            check_space(100, Some(10)),
            Err(SessionError::InsufficientSpace {
                required: 100,
                available: 10
            })
        ));
        assert!(check_space(100, Some(100)).is_ok());
        assert!(check_space(u64::MAX, None).is_ok());

        let dir = TempDir::new().unwrap();
        assert!(ensure_disk_space(&dir.path().join("missing/child"), 0).is_ok());
    }

    #[tokio::test]
    async fn test_reopen_truncates_torn_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s");
        let config = small_config();

        let mut session = Session::create(&path, &config, Arc::new(AcquisitionCounters::new()))
            .await
            .unwrap();
        session.append_samples(&samples(10));
        session.close().await.unwrap();

        // a crash in the middle of a record
        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .open(path.join(LOG_FILE))
            .unwrap();
        log.write_all(&[0xAB, 0xCD, 0xEF]).unwrap();
        drop(log);

        let mut reopened = Session::open(&path, &config, Arc::new(AcquisitionCounters::new()))
            .await
            .unwrap();
        assert_eq!(reopened.sample_count(), 10);
        reopened.append_sample(&SampleEvent::new(42.0, Some(7), 0.0));

        let records = reopened.read_samples(8, 3).await.unwrap();
        assert_eq!(records[0].value(), Some(8.0));
        assert_eq!(records[1].value(), None);
        assert_eq!(records[2].value(), Some(42.0));
        assert_eq!({ records[2].bits }, 7);
        reopened.close().await.unwrap();

        let len = std::fs::metadata(path.join(LOG_FILE)).unwrap().len();
        assert_eq!(len, index_to_offset(11));
    }

    fn folded(values: &[SampleEvent], max_elements: usize, period_us: f64) -> FoldingBuffer {
        let mut folding = FoldingBuffer::new(max_elements);
        for (i, sample) in values.iter().enumerate() {
            folding.add_data(sample.value, i as f64 * period_us);
        }
        folding
    }

    #[tokio::test]
    async fn test_reopen_catches_up_stale_minimap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s");
        let config = small_config();

        let mut input = samples(10);
        input.extend((0..20).map(|_| SampleEvent::new(999.0, None, 0.0)));

        let mut session = Session::create(&path, &config, Arc::new(AcquisitionCounters::new()))
            .await
            .unwrap();
        session.append_samples(&input[..10]);
        session.flush().await.unwrap();
        // the log moves on, the sidecars are never rewritten
        session.append_samples(&input[10..]);
        session.log_mut().flush().await.unwrap();
        drop(session);

        let reopened = Session::open(&path, &config, Arc::new(AcquisitionCounters::new()))
            .await
            .unwrap();
        assert_eq!(reopened.sample_count(), 30);
        assert_eq!(reopened.folding().sample_count(), 30);
        assert_eq!(reopened.folding(), &folded(&input, 8, 1000.0));
        let peak = reopened
            .folding()
            .data()
            .max
            .iter()
            .filter_map(|p| p.y)
            .fold(f32::MIN, f32::max);
        assert_eq!(peak, 999.0);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_minimap_ahead_of_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s");
        let config = small_config();

        let input = samples(40);
        let mut session = Session::create(&path, &config, Arc::new(AcquisitionCounters::new()))
            .await
            .unwrap();
        session.append_samples(&input);
        session.close().await.unwrap();

        let log = std::fs::OpenOptions::new()
            .write(true)
            .open(path.join(LOG_FILE))
            .unwrap();
        log.set_len(index_to_offset(25)).unwrap();
        drop(log);

        let reopened = Session::open(&path, &config, Arc::new(AcquisitionCounters::new()))
            .await
            .unwrap();
        assert_eq!(reopened.sample_count(), 25);
        assert_eq!(reopened.folding(), &folded(&input[..25], 8, 1000.0));
        reopened.close().await.unwrap();
    }
}
