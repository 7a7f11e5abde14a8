//! Region layout arithmetic.
//!
//! ```text
//! region_start                 heap_start                      heap_end
//! |-- local flags (max_flags) --|---------- heap (heap_size) ----------|-- remote flags --|
//! ```
//!
//! All three sections are one registration, so a peer's descriptor reaches
//! its flag sections by additive offsets from the descriptor base.

use crate::error::{RdsmError, Result};
use crate::types::FlagId;

/// Section sizes of one server's registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    heap_size: usize,
    local_flag_bytes: usize,
    remote_flag_bytes: usize,
}

impl RegionLayout {
    pub fn new(heap_size: usize, local_flag_bytes: usize, remote_flag_bytes: usize) -> Result<Self> {
        if heap_size == 0 || local_flag_bytes == 0 || remote_flag_bytes == 0 {
            return Err(RdsmError::Config(
                "heap and both flag sections must be non-empty".into(),
            ));
        }
        local_flag_bytes
            .checked_add(heap_size)
            .and_then(|s| s.checked_add(remote_flag_bytes))
            .ok_or_else(|| RdsmError::Config("region size overflows".into()))?;
        Ok(Self {
            heap_size,
            local_flag_bytes,
            remote_flag_bytes,
        })
    }

    /// `(region_start, region_size)` for a heap starting at `heap_start`.
    pub fn compute(&self, heap_start: usize) -> Result<(usize, usize)> {
        let region_start = heap_start.checked_sub(self.local_flag_bytes).ok_or_else(|| {
            RdsmError::Config(format!(
                "heap start {heap_start:#x} leaves no room for {} flag bytes",
                self.local_flag_bytes
            ))
        })?;
        Ok((region_start, self.region_size()))
    }

    pub fn region_size(&self) -> usize {
        self.local_flag_bytes + self.heap_size + self.remote_flag_bytes
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn max_flags(&self) -> usize {
        self.local_flag_bytes
    }

    /// Offset of the heap from the region start.
    pub fn heap_offset(&self) -> usize {
        self.local_flag_bytes
    }

    /// Offset of the remote sentinel byte from the region start.
    pub fn remote_flag_offset(&self) -> usize {
        self.local_flag_bytes + self.heap_size
    }

    /// Offset of flag `id` from the region start.
    ///
    /// Equivalently `heap_start - (max_flags - id)`.
    pub fn flag_offset(&self, id: FlagId) -> Result<usize> {
        if id >= self.local_flag_bytes {
            return Err(RdsmError::FlagOutOfRange {
                flag: id,
                max_flags: self.local_flag_bytes,
            });
        }
        Ok(id)
    }

    /// Region offset of heap range `[offset, offset + len)`, bounds-checked.
    pub fn heap_range(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.heap_size => Ok(self.local_flag_bytes + offset),
            _ => Err(RdsmError::OutOfBounds {
                what: "heap",
                offset,
                len,
                limit: self.heap_size,
            }),
        }
    }
}
