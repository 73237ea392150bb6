//! Chunk geometry shared by the server and the client.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Default chunk size shared by server and client (5 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Maps chunk indices to fixed, non-overlapping byte ranges of a file.
///
/// Every chunk is `chunk_size` bytes except possibly the last one.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkLayout {
    pub total_size: u64,
    pub chunk_size: u64,
}

impl ChunkLayout {
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        Self {
            total_size,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Byte offset where `index` begins.
    pub fn offset(&self, index: u64) -> u64 {
        index * self.chunk_size
    }

    /// Byte range covered by `index`, or `None` when out of bounds.
    pub fn range(&self, index: u64) -> Option<Range<u64>> {
        if index >= self.total_chunks() {
            return None;
        }
        let start = self.offset(index);
        let end = (start + self.chunk_size).min(self.total_size);
        Some(start..end)
    }

    /// Exact payload length expected for `index`.
    pub fn expected_len(&self, index: u64) -> Option<u64> {
        self.range(index).map(|r| r.end - r.start)
    }

    pub fn indices(&self) -> Range<u64> {
        0..self.total_chunks()
    }
}
