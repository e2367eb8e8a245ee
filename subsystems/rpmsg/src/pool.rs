//! # Shared Buffer Pool
//!
//! Bump allocator over a window of the shared buffer region. Buffers are
//! handed out in address order and never given back to the pool; recycling
//! happens one level up, on the device's reclaimer list.

use crate::{RpmsgError, RpmsgResult};
use amp_hal::{IoRegion, ScatterList, SgEntry};
use alloc::sync::Arc;

/// Monotonic buffer pool
#[derive(Debug, Clone)]
pub struct ShmPool {
    /// Region the pool lives in
    io: Arc<IoRegion>,
    /// Pool start inside `io`
    base: usize,
    /// Total bytes
    size: usize,
    /// Bytes not handed out yet
    avail: usize,
}

impl ShmPool {
    /// Pool over `[base, base + size)` of `io`
    pub fn new(io: Arc<IoRegion>, base: usize, size: usize) -> RpmsgResult<Self> {
        if size == 0 {
            return Err(RpmsgError::Param);
        }
        io.check(base, size)?;
        Ok(Self { io, base, size, avail: size })
    }

    /// Pool over the first entry of a mapped segment
    pub fn from_scatter_list(sg: &ScatterList) -> RpmsgResult<Self> {
        let entry = sg.first().ok_or(RpmsgError::Param)?;
        Self::new(entry.io.clone(), entry.offset, entry.len)
    }

    /// Take the next `size` bytes, or `None` once fewer remain
    pub fn get_buffer(&mut self, size: usize) -> Option<SgEntry> {
        if size == 0 || self.avail < size {
            return None;
        }
        let offset = self.base + (self.size - self.avail);
        self.avail -= size;
        SgEntry::new(self.io.clone(), offset, size).ok()
    }

    /// Region the pool lives in
    pub fn io(&self) -> &Arc<IoRegion> {
        &self.io
    }

    /// Total bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes not handed out yet
    pub fn available(&self) -> usize {
        self.avail
    }
}
