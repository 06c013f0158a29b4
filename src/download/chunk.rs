use serde::{Deserialize, Serialize};

use crate::files::FileDescriptor;

/// Byte range of a file, both bounds inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
    /// Bytes in the span assigned to the holder serving this range.
    pub total_per_contact: u64,
    /// Size of the whole file.
    pub total: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64, total_per_contact: u64, total: u64) -> Self {
        Self {
            start,
            end,
            total_per_contact,
            total,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Number of chunks a file of `total` bytes splits into.
pub fn chunk_count(total: u64, chunk_size: u64) -> u64 {
    total.div_ceil(chunk_size.max(1))
}

/// Byte bounds of chunk `index`. The last chunk may be short.
pub fn chunk_bounds(index: u64, chunk_size: u64, total: u64) -> ChunkRange {
    let chunk_size = chunk_size.max(1);
    let start = index * chunk_size;
    let end = (start + chunk_size).min(total) - 1;
    ChunkRange::new(start, end, end - start + 1, total)
}

/// Collapse sorted chunk indices into contiguous byte ranges.
pub fn merge_ranges(indices: &[u64], chunk_size: u64, total: u64) -> Vec<ChunkRange> {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<ChunkRange> = Vec::new();
    let mut previous: Option<u64> = None;
    for index in sorted {
        let bounds = chunk_bounds(index, chunk_size, total);
        match (ranges.last_mut(), previous) {
            (Some(last), Some(prev)) if prev + 1 == index => {
                last.end = bounds.end;
                last.total_per_contact = last.len();
            }
            _ => ranges.push(bounds),
        }
        previous = Some(index);
    }
    ranges
}

/// One holder's share of a file: a contiguous span plus the chunks of it
/// still missing. Cloned before every network attempt so a failed worker
/// never disturbs the plan it was started from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadChunkRequest {
    pub file: FileDescriptor,
    /// The whole span assigned to the holder.
    pub range: ChunkRange,
    /// Chunk indices of the span not yet written, ascending.
    pub pending_chunks: Vec<u64>,
    /// Bytes of the span written so far.
    pub downloaded_bytes: u64,
    /// Chunks written by the current attempt, in write order.
    pub confirmed: Vec<u64>,
}

impl DownloadChunkRequest {
    pub fn is_complete(&self) -> bool {
        self.pending_chunks.is_empty()
    }

    /// Record chunk `index` of `len` bytes as written.
    pub fn mark_written(&mut self, index: u64, len: u64) {
        if let Some(pos) = self.pending_chunks.iter().position(|i| *i == index) {
            self.pending_chunks.remove(pos);
            self.downloaded_bytes += len;
            self.confirmed.push(index);
        }
    }

    /// Chunks confirmed written since this request was planned.
    pub fn written_chunks(&self) -> Vec<u64> {
        self.confirmed.clone()
    }
}
