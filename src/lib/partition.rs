//! Divides a [`RecordIndex`](crate::record_index::RecordIndex) into contiguous byte ranges that
//! are processed independently.

use std::fmt::Display;

use crate::record_index::PairedRecordIndex;

/// The default number of ranges created per worker thread.
pub const DEFAULT_FANOUT: usize = 5;

/// A span of the (decompressed) input, `start` inclusive and `end` exclusive.  Both ends are
/// record boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The number of bytes in the range.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The ranges of a read 1 and read 2 FASTQ that hold the same read pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairedRange {
    pub r1: ByteRange,
    pub r2: ByteRange,
}

impl PairedRange {
    pub fn is_empty(&self) -> bool {
        self.r1.is_empty() && self.r2.is_empty()
    }
}

/// The start positions into `offsets` of each window and the index of its last offset.
fn windows(len: usize, worker_count: usize, fanout: usize) -> Vec<(usize, usize)> {
    if len == 0 {
        return vec![];
    }
    let groups = (worker_count * fanout).max(1);
    let chunk = ((len + groups - 1) / groups).max(1);
    (0..len).step_by(chunk).map(|i| (i, (i + chunk).min(len - 1))).collect()
}

/// Splits the offsets into about `worker_count * fanout` ranges of roughly equal record count.
///
/// Consecutive ranges share a boundary offset, so the ranges cover the input without gaps or
/// overlaps.  The last range may be empty.
pub fn partition(offsets: &[u64], worker_count: usize, fanout: usize) -> Vec<ByteRange> {
    windows(offsets.len(), worker_count, fanout)
        .into_iter()
        .map(|(start, end)| ByteRange::new(offsets[start], offsets[end]))
        .collect()
}

/// Splits paired indexes so the `i`-th read 1 and read 2 ranges hold the same read pairs.
pub fn partition_paired(
    index: &PairedRecordIndex,
    worker_count: usize,
    fanout: usize,
) -> Vec<PairedRange> {
    let r1 = index.r1.offsets();
    let r2 = index.r2.offsets();
    windows(r1.len().min(r2.len()), worker_count, fanout)
        .into_iter()
        .map(|(start, end)| PairedRange {
            r1: ByteRange::new(r1[start], r1[end]),
            r2: ByteRange::new(r2[start], r2[end]),
        })
        .collect()
}
