//! Storage component - disk-backed paged log
//!
//! Architecture (one task per disk resource):
//! - Flush task: mpsc channel → append to the log file, one job at a time
//! - Read task: mpsc channel → positional reads, one job at a time
//! - [`WriteBuffer`]: in-memory pages trailing the write pointer
//! - [`ReadCache`]: in-memory pages around the last random read
//!
//! Disk failures never stop a queue. A job is retried, then dropped; the
//! drop is logged, counted and reported on the error channel drained by
//! [`PagedLog::take_errors`].

pub mod page;
pub mod range;
pub mod read_cache;
pub mod write_buffer;

pub use page::{Page, PagePool};
pub use range::{merge_ranges, ByteRange};
pub use read_cache::ReadCache;
pub use write_buffer::WriteBuffer;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::AcquisitionCounters;
use crate::config::StorageConfig;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write of {len} bytes at {offset} dropped after {attempts} attempts: {reason}")]
    WriteFailed {
        offset: u64,
        len: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Read of {len} bytes at {offset} dropped after {attempts} attempts: {reason}")]
    ReadFailed {
        offset: u64,
        len: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Read of {len} bytes at {offset} is beyond the log end ({available})")]
    OutOfBounds {
        offset: u64,
        len: usize,
        available: u64,
    },

    #[error("Disk queue closed")]
    QueueClosed,
}

impl StorageError {
    pub fn is_write_failure(&self) -> bool {
        matches!(self, StorageError::WriteFailed { .. })
    }
}

/// Where the read cache places its window relative to a missed read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchBias {
    /// Window starts at the read (scrolling forward)
    Start,
    /// Window ends at the read (scrolling backward)
    End,
    /// Window centered on the read
    #[default]
    Center,
}

/// Jobs for the flush task
#[derive(Debug)]
pub(crate) enum FlushJob {
    /// Write bytes at their log offset
    Append { offset: u64, data: Bytes },
    /// Flush and fsync, then reply
    Sync {
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
}

/// Job for the read task
#[derive(Debug)]
pub(crate) struct ReadJob {
    pub offset: u64,
    pub len: usize,
    /// Prefetches carry a flag; direct reads are never cancelled
    pub cancelled: Option<Arc<AtomicBool>>,
    pub reply: oneshot::Sender<Result<Bytes, StorageError>>,
}

/// Append-only log file with a write buffer and a read cache
#[derive(Debug)]
pub struct PagedLog {
    path: PathBuf,
    write: WriteBuffer,
    cache: ReadCache,
    flush_tx: mpsc::UnboundedSender<FlushJob>,
    errors_rx: mpsc::UnboundedReceiver<StorageError>,
    flush_handle: JoinHandle<()>,
    read_handle: JoinHandle<()>,
}

impl PagedLog {
    /// Create a new, empty log (truncates an existing file)
    pub async fn create<P: AsRef<Path>>(
        path: P,
        config: &StorageConfig,
        counters: Arc<AcquisitionCounters>,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "Created log");
        Self::start(path, file, 0, config, counters).await
    }

    /// Open an existing log and continue appending at its end
    pub async fn open<P: AsRef<Path>>(
        path: P,
        config: &StorageConfig,
        counters: Arc<AcquisitionCounters>,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().write(true).open(&path).await?;
        let len = file.metadata().await?.len();
        info!(path = %path.display(), len, "Opened log");
        Self::start(path, file, len, config, counters).await
    }

    async fn start(
        path: PathBuf,
        write_file: File,
        len: u64,
        config: &StorageConfig,
        counters: Arc<AcquisitionCounters>,
    ) -> Result<Self, StorageError> {
        let read_file = File::open(&path).await?;
        let attempts = config.io_retries.max(1);
        let flushed_len = Arc::new(AtomicU64::new(len));

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let flush_handle = tokio::spawn(flush_task(
            flush_rx,
            write_file,
            flushed_len.clone(),
            errors_tx.clone(),
            counters.clone(),
            attempts,
        ));
        let read_handle = tokio::spawn(read_task(
            read_rx,
            read_file,
            errors_tx,
            counters.clone(),
            attempts,
        ));

        let write = WriteBuffer::new(
            config.page_size,
            config.write_pages,
            len,
            flushed_len.clone(),
            flush_tx.clone(),
            counters.clone(),
        );
        let cache = ReadCache::new(
            config.page_size,
            config.read_pages,
            config.prefetch_bias,
            read_tx,
            flushed_len,
            counters,
        );

        Ok(Self {
            path,
            write,
            cache,
            flush_tx,
            errors_rx,
            flush_handle,
            read_handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical length of the log
    pub fn len(&self) -> u64 {
        self.write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.write.is_empty()
    }

    /// Bytes confirmed on disk
    pub fn flushed_len(&self) -> u64 {
        self.write.flushed_len()
    }

    pub fn write_buffer(&self) -> &WriteBuffer {
        &self.write
    }

    pub fn read_cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn read_cache_mut(&mut self) -> &mut ReadCache {
        &mut self.cache
    }

    /// Append bytes; returns once they are in memory
    pub fn append(&mut self, data: &[u8]) {
        self.write.append(data);
    }

    /// Read `[offset, offset + len)` from wherever it currently lives
    ///
    /// Resident write pages are tried first. Otherwise the part already on
    /// disk goes through the read cache and the rest comes from write pages.
    pub async fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let total = self.len();
        if offset + len as u64 > total {
            return Err(StorageError::OutOfBounds {
                offset,
                len,
                available: total,
            });
        }
        if let Some(data) = self.write.read(offset, len) {
            return Ok(data);
        }

        let flushed = self.flushed_len();
        let disk_len = flushed.saturating_sub(offset).min(len as u64) as usize;
        let mut out = if disk_len > 0 {
            self.cache.read(offset, disk_len).await?
        } else {
            Vec::new()
        };
        if disk_len < len {
            let mut tail = vec![0u8; len - disk_len];
            let tail_offset = offset + disk_len as u64;
            let copied = self.write.copy_resident(tail_offset, &mut tail);
            if copied < tail.len() {
                warn!(
                    offset = tail_offset,
                    missing = tail.len() - copied,
                    "Bytes neither on disk nor resident"
                );
            }
            out.extend_from_slice(&tail);
        }
        Ok(out)
    }

    /// Hand every buffered byte to the flush task and wait for fsync
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        self.write.flush();
        let (reply, rx) = oneshot::channel();
        self.flush_tx
            .send(FlushJob::Sync { reply })
            .map_err(|_| StorageError::QueueClosed)?;
        let synced = rx.await.map_err(|_| StorageError::QueueClosed)?;
        self.write.evict();
        synced
    }

    /// Failures reported by the disk queues since the last call
    pub fn take_errors(&mut self) -> Vec<StorageError> {
        let mut errors = Vec::new();
        while let Ok(err) = self.errors_rx.try_recv() {
            errors.push(err);
        }
        errors
    }

    /// Flush, fsync and stop both queues
    ///
    /// Returns the first write failure not yet taken by [`take_errors`].
    ///
    /// [`take_errors`]: PagedLog::take_errors
    pub async fn close(mut self) -> Result<(), StorageError> {
        self.cache.cancel_prefetches().await;
        let synced = self.flush().await;

        let PagedLog {
            path,
            write,
            cache,
            flush_tx,
            mut errors_rx,
            flush_handle,
            read_handle,
        } = self;
        drop(write);
        drop(cache);
        drop(flush_tx);
        if let Err(e) = flush_handle.await {
            warn!(error = %e, "Flush task ended abnormally");
        }
        if let Err(e) = read_handle.await {
            warn!(error = %e, "Read task ended abnormally");
        }

        let mut first_write_error = None;
        while let Ok(err) = errors_rx.try_recv() {
            if err.is_write_failure() && first_write_error.is_none() {
                first_write_error = Some(err);
            }
        }
        info!(path = %path.display(), "Closed log");

        match first_write_error {
            Some(err) => Err(err),
            None => synced,
        }
    }
}

/// Flush task: drains jobs one at a time so file offsets never race
async fn flush_task(
    mut rx: mpsc::UnboundedReceiver<FlushJob>,
    mut file: File,
    flushed_len: Arc<AtomicU64>,
    errors: mpsc::UnboundedSender<StorageError>,
    counters: Arc<AcquisitionCounters>,
    attempts: u32,
) {
    while let Some(job) = rx.recv().await {
        match job {
            FlushJob::Append { offset, data } => {
                let mut last_error = None;
                for attempt in 1..=attempts {
                    match write_at(&mut file, offset, &data).await {
                        Ok(()) => {
                            last_error = None;
                            break;
                        }
                        Err(e) => {
                            warn!(offset, attempt, error = %e, "Log write failed");
                            last_error = Some(e);
                        }
                    }
                }
                match last_error {
                    None => {
                        counters.add_flushed(data.len() as u64);
                    }
                    Some(e) => {
                        error!(offset, len = data.len(), error = %e, "Dropping log write");
                        counters.inc_failed_io();
                        let _ = errors.send(StorageError::WriteFailed {
                            offset,
                            len: data.len(),
                            attempts,
                            reason: e.to_string(),
                        });
                    }
                }
                // a dropped write still advances the queue
                flushed_len.fetch_max(offset + data.len() as u64, Ordering::AcqRel);
            }
            FlushJob::Sync { reply } => {
                let result = async {
                    file.flush().await?;
                    file.sync_all().await
                }
                .await
                .map_err(StorageError::from);
                debug!(ok = result.is_ok(), "Log synced");
                let _ = reply.send(result);
            }
        }
    }
    debug!("Flush task completed");
}

async fn write_at(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}

/// Read task: drains jobs one at a time, skipping cancelled prefetches
async fn read_task(
    mut rx: mpsc::UnboundedReceiver<ReadJob>,
    mut file: File,
    errors: mpsc::UnboundedSender<StorageError>,
    counters: Arc<AcquisitionCounters>,
    attempts: u32,
) {
    while let Some(job) = rx.recv().await {
        let is_cancelled = || {
            job.cancelled
                .as_ref()
                .map_or(false, |flag| flag.load(Ordering::Acquire))
        };
        if is_cancelled() {
            continue;
        }

        let mut result = Err(StorageError::QueueClosed);
        for attempt in 1..=attempts {
            match read_at(&mut file, job.offset, job.len).await {
                Ok(data) => {
                    result = Ok(data);
                    break;
                }
                Err(e) => {
                    warn!(offset = job.offset, attempt, error = %e, "Log read failed");
                    result = Err(StorageError::ReadFailed {
                        offset: job.offset,
                        len: job.len,
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Err(e) = &result {
            error!(offset = job.offset, len = job.len, error = %e, "Dropping log read");
            counters.inc_failed_io();
            let _ = errors.send(StorageError::ReadFailed {
                offset: job.offset,
                len: job.len,
                attempts,
                reason: e.to_string(),
            });
        }
        if is_cancelled() {
            continue;
        }
        let _ = job.reply.send(result.map(Bytes::from));
    }
    debug!("Read task completed");
}

async fn read_at(file: &mut File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
