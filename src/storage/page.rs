//! Fixed-size pages and the freelist they are recycled through

use super::range::ByteRange;

/// One page of the logical log
#[derive(Debug)]
pub struct Page {
    data: Vec<u8>,
    start: u64,
    written: usize,
    /// Bytes already handed to the flush queue
    queued: usize,
}

impl Page {
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0; page_size],
            start: 0,
            written: 0,
            queued: 0,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Exclusive end of the written bytes
    pub fn end(&self) -> u64 {
        self.start + self.written as u64
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.written
    }

    pub fn is_full(&self) -> bool {
        self.written == self.data.len()
    }

    pub fn range(&self) -> Option<ByteRange> {
        ByteRange::from_len(self.start, self.written as u64)
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.written]
    }

    /// Copy as much of `bytes` as fits; returns the number of bytes taken
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data[self.written..self.written + n].copy_from_slice(&bytes[..n]);
        self.written += n;
        n
    }

    /// Written bytes not yet handed to the flush queue, marking them queued
    pub fn take_unqueued(&mut self) -> Option<(u64, &[u8])> {
        if self.queued == self.written {
            return None;
        }
        let from = self.queued;
        self.queued = self.written;
        Some((self.start + from as u64, &self.data[from..self.written]))
    }

    /// Copy the part of `[offset, offset + out.len())` held by this page
    ///
    /// Returns the number of bytes copied.
    pub fn copy_to(&self, offset: u64, out: &mut [u8]) -> usize {
        let (Some(page), Some(want)) = (self.range(), ByteRange::from_len(offset, out.len() as u64))
        else {
            return 0;
        };
        let Some(common) = page.intersect(&want) else {
            return 0;
        };
        let src = (common.start - self.start) as usize;
        let dst = (common.start - offset) as usize;
        let n = common.len() as usize;
        out[dst..dst + n].copy_from_slice(&self.data[src..src + n]);
        n
    }

    /// Load a page read back from disk
    pub(crate) fn fill(&mut self, start: u64, bytes: &[u8]) {
        self.reset(start);
        let n = self.write(bytes);
        self.queued = n;
    }

    fn reset(&mut self, start: u64) {
        self.start = start;
        self.written = 0;
        self.queued = 0;
    }
}

/// Freelist of pages of one size
#[derive(Debug)]
pub struct PagePool {
    page_size: usize,
    free: Vec<Page>,
}

impl PagePool {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            free: Vec::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// A blank page starting at `start`, recycled when possible
    pub fn acquire(&mut self, start: u64) -> Page {
        let mut page = self.free.pop().unwrap_or_else(|| Page::new(self.page_size));
        page.reset(start);
        page
    }

    pub fn release(&mut self, page: Page) {
        if page.capacity() == self.page_size {
            self.free.push(page);
        }
    }

    pub fn free_pages(&self) -> usize {
        self.free.len()
    }
}
