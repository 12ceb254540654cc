//! Inclusive byte intervals used for cache-hit testing

/// Inclusive byte interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Range covering `len` bytes from `offset`; `None` when `len` is zero
    pub fn from_len(offset: u64, len: u64) -> Option<Self> {
        if len == 0 {
            None
        } else {
            Some(Self::new(offset, offset + len - 1))
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Exclusive end offset
    pub fn end_exclusive(&self) -> u64 {
        self.end + 1
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset <= self.end
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Whether `self` covers every byte of `inner`
    pub fn full_overlap(&self, inner: &ByteRange) -> bool {
        self.start <= inner.start && inner.end <= self.end
    }

    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        if self.overlaps(other) {
            Some(ByteRange::new(
                self.start.max(other.start),
                self.end.min(other.end),
            ))
        } else {
            None
        }
    }
}

/// Coalesce overlapping and adjacent ranges
///
/// The result is sorted by start and contains no two ranges that overlap or
/// touch.
pub fn merge_ranges(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
    ranges.sort_unstable();
    let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.end.saturating_add(1) >= range.start => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Whether the union of `ranges` covers all of `target`
pub fn covers(ranges: Vec<ByteRange>, target: &ByteRange) -> bool {
    merge_ranges(ranges)
        .iter()
        .any(|range| range.full_overlap(target))
}
