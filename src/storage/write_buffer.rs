//! Producer side of the paged log
//!
//! Appends are copied into in-memory pages and return immediately. Full
//! pages are handed to the flush queue, which appends them to the file one
//! job at a time. Pages trailing the write pointer stay resident so recent
//! data can be read back without touching the disk.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::page::{Page, PagePool};
use super::range::{covers, ByteRange};
use super::FlushJob;
use crate::common::AcquisitionCounters;

/// In-memory write window over the log
#[derive(Debug)]
pub struct WriteBuffer {
    pages: VecDeque<Page>,
    pool: PagePool,
    max_pages: usize,
    total_len: u64,
    flushed_len: Arc<AtomicU64>,
    flush_tx: mpsc::UnboundedSender<FlushJob>,
    counters: Arc<AcquisitionCounters>,
}

impl WriteBuffer {
    pub(crate) fn new(
        page_size: usize,
        max_pages: usize,
        start_len: u64,
        flushed_len: Arc<AtomicU64>,
        flush_tx: mpsc::UnboundedSender<FlushJob>,
        counters: Arc<AcquisitionCounters>,
    ) -> Self {
        Self {
            pages: VecDeque::with_capacity(max_pages + 1),
            pool: PagePool::new(page_size),
            max_pages,
            total_len: start_len,
            flushed_len,
            flush_tx,
            counters,
        }
    }

    /// Logical length of the log
    pub fn len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Bytes confirmed on disk
    pub fn flushed_len(&self) -> u64 {
        self.flushed_len.load(Ordering::Acquire)
    }

    /// Written sizes of the resident pages, oldest first
    pub fn page_lengths(&self) -> Vec<usize> {
        self.pages.iter().map(Page::written).collect()
    }

    /// The byte interval the buffer tries to keep resident
    pub fn ideal_range(&self) -> Option<ByteRange> {
        let window = (self.max_pages * self.pool.page_size()) as u64;
        let start = self.total_len.saturating_sub(window);
        ByteRange::from_len(start, self.total_len - start)
    }

    /// Copy `data` into pages; full pages are queued for flushing
    pub fn append(&mut self, mut data: &[u8]) {
        self.counters.add_appended(data.len() as u64);
        while !data.is_empty() {
            if self.pages.back().map_or(true, Page::is_full) {
                let page = self.pool.acquire(self.total_len);
                self.pages.push_back(page);
            }
            let Some(page) = self.pages.back_mut() else {
                break;
            };
            let n = page.write(data);
            data = &data[n..];
            self.total_len += n as u64;

            if page.is_full() {
                Self::queue_page(&self.flush_tx, page);
            }
        }
        self.evict();
    }

    /// Queue every written byte not yet handed to the flush task
    pub fn flush(&mut self) {
        for page in self.pages.iter_mut() {
            Self::queue_page(&self.flush_tx, page);
        }
    }

    /// Read `[offset, offset + len)` if resident pages hold all of it
    pub fn read(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let want = ByteRange::from_len(offset, len as u64)?;
        let resident: Vec<ByteRange> = self
            .pages
            .iter()
            .filter_map(Page::range)
            .filter(|r| r.overlaps(&want))
            .collect();
        if !covers(resident, &want) {
            return None;
        }
        let mut out = vec![0u8; len];
        for page in &self.pages {
            page.copy_to(offset, &mut out);
        }
        Some(out)
    }

    /// Copy whatever resident pages hold of the request into `out`
    pub(crate) fn copy_resident(&self, offset: u64, out: &mut [u8]) -> usize {
        self.pages.iter().map(|page| page.copy_to(offset, out)).sum()
    }

    fn queue_page(tx: &mpsc::UnboundedSender<FlushJob>, page: &mut Page) {
        if let Some((offset, bytes)) = page.take_unqueued() {
            trace!(offset, len = bytes.len(), "Queue flush");
            if tx
                .send(FlushJob::Append {
                    offset,
                    data: Bytes::copy_from_slice(bytes),
                })
                .is_err()
            {
                debug!(offset, "Flush queue closed, dropping page");
            }
        }
    }

    /// Drop pages outside the ideal range once their bytes are on disk
    pub(crate) fn evict(&mut self) {
        let Some(ideal) = self.ideal_range() else {
            return;
        };
        let flushed = self.flushed_len();
        while let Some(front) = self.pages.front() {
            let outside = front.end() <= ideal.start;
            if !outside || front.end() > flushed {
                break;
            }
            if let Some(page) = self.pages.pop_front() {
                trace!(start = page.start(), "Evict write page");
                self.pool.release(page);
            }
        }
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        // the flush task outlives the buffer and still writes the tail
        self.flush();
    }
}
