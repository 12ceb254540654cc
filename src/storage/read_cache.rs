//! Consumer side of the paged log
//!
//! Serves arbitrary reads from resident pages when they cover the request.
//! On a miss, outstanding prefetches are cancelled and awaited, the request
//! is read straight from disk, and a fresh set of page prefetches is issued
//! around it. Prefetch results are installed lazily at the next read.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::page::{Page, PagePool};
use super::range::{covers, ByteRange};
use super::{PrefetchBias, ReadJob, StorageError};
use crate::common::AcquisitionCounters;

/// A page read in flight
#[derive(Debug)]
struct Prefetch {
    start: u64,
    cancelled: Arc<AtomicBool>,
    reply: oneshot::Receiver<Result<Bytes, StorageError>>,
}

/// Page cache for random reads
#[derive(Debug)]
pub struct ReadCache {
    pages: Vec<Page>,
    pool: PagePool,
    max_pages: usize,
    bias: PrefetchBias,
    in_flight: Vec<Prefetch>,
    read_tx: mpsc::UnboundedSender<ReadJob>,
    flushed_len: Arc<AtomicU64>,
    counters: Arc<AcquisitionCounters>,
}

impl ReadCache {
    pub(crate) fn new(
        page_size: usize,
        max_pages: usize,
        bias: PrefetchBias,
        read_tx: mpsc::UnboundedSender<ReadJob>,
        flushed_len: Arc<AtomicU64>,
        counters: Arc<AcquisitionCounters>,
    ) -> Self {
        Self {
            pages: Vec::with_capacity(max_pages),
            pool: PagePool::new(page_size),
            max_pages,
            bias,
            in_flight: Vec::new(),
            read_tx,
            flushed_len,
            counters,
        }
    }

    pub fn bias(&self) -> PrefetchBias {
        self.bias
    }

    /// Direction of the next prefetch (follows the viewer's scroll direction)
    pub fn set_bias(&mut self, bias: PrefetchBias) {
        self.bias = bias;
    }

    /// Ranges of the resident pages, sorted by start
    pub fn resident_ranges(&self) -> Vec<ByteRange> {
        let mut ranges: Vec<ByteRange> = self.pages.iter().filter_map(Page::range).collect();
        ranges.sort_unstable();
        ranges
    }

    pub fn prefetches_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Read `[offset, offset + len)`; the range must already be on disk
    pub async fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let Some(want) = ByteRange::from_len(offset, len as u64) else {
            return Ok(Vec::new());
        };
        self.install_ready();

        if let Some(data) = self.read_resident(&want) {
            self.counters.inc_read_hit();
            trace!(offset, len, "Read cache hit");
            return Ok(data);
        }

        self.counters.inc_read_miss();
        debug!(offset, len, "Read cache miss");
        self.cancel_prefetches().await;
        let data = self.read_direct(offset, len).await?;
        self.prefetch_around(&want);
        Ok(data.to_vec())
    }

    /// Wait for every outstanding prefetch and install the results
    pub async fn settle(&mut self) {
        let in_flight = std::mem::take(&mut self.in_flight);
        let starts: Vec<(u64, Arc<AtomicBool>)> = in_flight
            .iter()
            .map(|p| (p.start, p.cancelled.clone()))
            .collect();
        let results = join_all(in_flight.into_iter().map(|p| p.reply)).await;
        for ((start, cancelled), result) in starts.into_iter().zip(results) {
            if let Ok(Ok(bytes)) = result {
                if !cancelled.load(Ordering::Acquire) {
                    self.install(start, &bytes);
                }
            }
        }
    }

    /// Cancel outstanding prefetches and wait until each has settled
    pub async fn cancel_prefetches(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let in_flight = std::mem::take(&mut self.in_flight);
        for prefetch in &in_flight {
            prefetch.cancelled.store(true, Ordering::Release);
        }
        trace!(count = in_flight.len(), "Cancelling prefetches");
        // results of cancelled reads are discarded
        join_all(in_flight.into_iter().map(|p| p.reply)).await;
    }

    /// Drop all resident pages (session reset)
    pub async fn clear(&mut self) {
        self.cancel_prefetches().await;
        for page in self.pages.drain(..) {
            self.pool.release(page);
        }
    }

    fn install_ready(&mut self) {
        let in_flight = std::mem::take(&mut self.in_flight);
        for mut prefetch in in_flight {
            match prefetch.reply.try_recv() {
                Ok(Ok(bytes)) => {
                    if !prefetch.cancelled.load(Ordering::Acquire) {
                        self.install(prefetch.start, &bytes);
                    }
                }
                Err(oneshot::error::TryRecvError::Empty) => self.in_flight.push(prefetch),
                // failures are reported by the read task
                Ok(Err(_)) | Err(oneshot::error::TryRecvError::Closed) => {}
            }
        }
    }

    fn install(&mut self, start: u64, bytes: &[u8]) {
        if let Some(pos) = self.pages.iter().position(|p| p.start() == start) {
            let old = self.pages.swap_remove(pos);
            self.pool.release(old);
        }
        let mut page = self.pool.acquire(start);
        page.fill(start, bytes);
        self.pages.push(page);
    }

    fn read_resident(&self, want: &ByteRange) -> Option<Vec<u8>> {
        let overlapping: Vec<ByteRange> = self
            .pages
            .iter()
            .filter_map(Page::range)
            .filter(|r| r.overlaps(want))
            .collect();
        if !covers(overlapping, want) {
            return None;
        }
        let mut out = vec![0u8; want.len() as usize];
        for page in &self.pages {
            page.copy_to(want.start, &mut out);
        }
        Some(out)
    }

    async fn read_direct(&self, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.read_tx
            .send(ReadJob {
                offset,
                len,
                cancelled: None,
                reply,
            })
            .map_err(|_| StorageError::QueueClosed)?;
        rx.await.map_err(|_| StorageError::QueueClosed)?
    }

    /// Page-aligned interval to keep resident around `want`, clipped to disk
    fn ideal_range(&self, want: &ByteRange) -> Option<ByteRange> {
        let page_size = self.pool.page_size() as u64;
        let window = page_size * self.max_pages as u64;
        let align_down = |x: u64| x / page_size * page_size;

        let start = match self.bias {
            PrefetchBias::Start => align_down(want.start),
            PrefetchBias::End => {
                let end = want.end_exclusive().div_ceil(page_size) * page_size;
                end.saturating_sub(window)
            }
            PrefetchBias::Center => {
                let mid = want.start + want.len() / 2;
                align_down(mid.saturating_sub(window / 2))
            }
        };
        let end = (start + window).min(self.flushed_len.load(Ordering::Acquire));
        if start >= end {
            return None;
        }
        Some(ByteRange::new(start, end - 1))
    }

    fn prefetch_around(&mut self, want: &ByteRange) {
        let Some(ideal) = self.ideal_range(want) else {
            return;
        };

        let mut kept = Vec::with_capacity(self.pages.len());
        for page in self.pages.drain(..) {
            match page.range() {
                Some(range) if range.overlaps(&ideal) => kept.push(page),
                _ => self.pool.release(page),
            }
        }
        self.pages = kept;

        let page_size = self.pool.page_size() as u64;
        let mut start = ideal.start;
        while start <= ideal.end {
            let len = page_size.min(ideal.end_exclusive() - start) as usize;
            let resident = self
                .pages
                .iter()
                .any(|p| p.start() == start && p.written() >= len);
            if !resident {
                self.issue_prefetch(start, len);
            }
            start += page_size;
        }
        trace!(
            start = ideal.start,
            end = ideal.end,
            in_flight = self.in_flight.len(),
            "Prefetch issued"
        );
    }

    fn issue_prefetch(&mut self, start: u64, len: usize) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply, rx) = oneshot::channel();
        let job = ReadJob {
            offset: start,
            len,
            cancelled: Some(cancelled.clone()),
            reply,
        };
        if self.read_tx.send(job).is_err() {
            debug!(start, "Read queue closed, prefetch skipped");
            return;
        }
        self.in_flight.push(Prefetch {
            start,
            cancelled,
            reply: rx,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::range::merge_ranges;

    fn disk() -> Vec<u8> {
        (0..100u8).collect()
    }

    fn new_cache(
        bias: PrefetchBias,
    ) -> (
        ReadCache,
        mpsc::UnboundedReceiver<ReadJob>,
        Arc<AcquisitionCounters>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(AcquisitionCounters::new());
        let flushed = Arc::new(AtomicU64::new(100));
        let cache = ReadCache::new(10, 4, bias, tx, flushed, counters.clone());
        (cache, rx, counters)
    }

    /// Answer a job from the in-memory disk image
    fn serve(job: ReadJob, disk: &[u8]) -> (u64, usize) {
        let start = job.offset as usize;
        let data = Bytes::copy_from_slice(&disk[start..start + job.len]);
        let _ = job.reply.send(Ok(data));
        (job.offset, job.len)
    }

    fn queued(rx: &mut mpsc::UnboundedReceiver<ReadJob>) -> Vec<ReadJob> {
        let mut jobs = Vec::new();
        while let Ok(job) = rx.try_recv() {
            jobs.push(job);
        }
        jobs
    }

    /// A missed read: serve the direct job, leave the prefetches queued
    async fn miss(
        cache: &mut ReadCache,
        rx: &mut mpsc::UnboundedReceiver<ReadJob>,
        offset: u64,
        len: usize,
    ) -> Vec<u8> {
        let disk = disk();
        let (data, direct) = tokio::join!(cache.read(offset, len), async {
            let job = rx.recv().await.unwrap();
            assert!(job.cancelled.is_none());
            serve(job, &disk)
        });
        assert_eq!(direct, (offset, len));
        data.unwrap()
    }

    #[tokio::test]
    async fn test_cancelled_prefetch_never_installed() {
        let (mut cache, mut rx, counters) = new_cache(PrefetchBias::Start);
        let disk = disk();

        assert_eq!(miss(&mut cache, &mut rx, 20, 5).await, disk[20..25].to_vec());
        let jobs = queued(&mut rx);
        let starts: Vec<u64> = jobs.iter().map(|j| j.offset).collect();
        assert_eq!(starts, vec![20, 30, 40, 50]);
        assert_eq!(cache.prefetches_in_flight(), 4);
        let flags: Vec<Arc<AtomicBool>> = jobs.iter().filter_map(|j| j.cancelled.clone()).collect();

        // the reads complete with data while the cancel is in progress
        tokio::join!(cache.cancel_prefetches(), async {
            for job in jobs {
                serve(job, &disk);
            }
        });

        assert!(flags.iter().all(|f| f.load(Ordering::Acquire)));
        assert_eq!(cache.prefetches_in_flight(), 0);
        assert!(cache.resident_ranges().is_empty());

        // still nothing resident, so the same read misses again
        miss(&mut cache, &mut rx, 20, 5).await;
        assert_eq!(counters.snapshot().read_misses, 2);
        assert_eq!(counters.snapshot().read_hits, 0);
    }

    #[tokio::test]
    async fn test_miss_cancels_previous_prefetches() {
        let (mut cache, mut rx, _) = new_cache(PrefetchBias::Start);
        let disk = disk();

        miss(&mut cache, &mut rx, 0, 5).await;
        let stale = queued(&mut rx);
        assert_eq!(stale.len(), 4);

        // a second miss elsewhere while the first prefetches are unanswered
        let (data, ()) = tokio::join!(cache.read(70, 5), async {
            tokio::task::yield_now().await;
            for job in stale {
                serve(job, &disk);
            }
            let direct = rx.recv().await.unwrap();
            serve(direct, &disk);
        });
        assert_eq!(data.unwrap(), disk[70..75].to_vec());

        for job in queued(&mut rx) {
            serve(job, &disk);
        }
        cache.settle().await;
        assert_eq!(merge_ranges(cache.resident_ranges()), vec![ByteRange::new(70, 99)]);
    }

    #[tokio::test]
    async fn test_prefetch_window_follows_bias() {
        let cases = [
            (PrefetchBias::Start, 23u64, 4usize, ByteRange::new(20, 59)),
            (PrefetchBias::End, 63, 4, ByteRange::new(30, 69)),
            (PrefetchBias::Center, 50, 10, ByteRange::new(30, 69)),
        ];
        for (bias, offset, len, expected) in cases {
            let (mut cache, mut rx, _) = new_cache(bias);
            let disk = disk();
            miss(&mut cache, &mut rx, offset, len).await;

            // settle waits for replies that arrive later
            tokio::join!(cache.settle(), async {
                tokio::task::yield_now().await;
                for job in queued(&mut rx) {
                    serve(job, &disk);
                }
            });
            assert_eq!(cache.prefetches_in_flight(), 0);
            assert_eq!(merge_ranges(cache.resident_ranges()), vec![expected], "{bias:?}");
        }
    }

    #[tokio::test]
    async fn test_ready_prefetches_installed_on_next_read() {
        let (mut cache, mut rx, counters) = new_cache(PrefetchBias::Start);
        let disk = disk();

        miss(&mut cache, &mut rx, 40, 2).await;
        for job in queued(&mut rx) {
            serve(job, &disk);
        }

        // no settle: the hit comes from replies picked up by the read itself
        let data = cache.read(45, 30).await.unwrap();
        assert_eq!(data, disk[45..75].to_vec());
        assert!(rx.try_recv().is_err());
        assert_eq!(counters.snapshot().read_hits, 1);
        assert_eq!(cache.prefetches_in_flight(), 0);
    }
}
