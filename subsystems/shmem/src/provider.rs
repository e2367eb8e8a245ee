//! # Shared Memory Providers
//!
//! A provider owns a name-space (`"<provider>/..."`) and allocates segments in
//! it on demand. Providers are registered once at init time and outlive every
//! segment they create.

use crate::segment::{ShmFlags, ShmOps};
use crate::{SharedMemory, ShmError, ShmResult};
use amp_hal::{align_up, IoRegion, ScatterList};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

/// Backing produced by [`ShmProvider::alloc`]
pub struct ShmAllocation {
    /// Size actually allocated
    pub size: usize,
    /// Default mapping of the new segment
    pub sg: ScatterList,
    /// Segment hooks, if the provider needs any
    pub ops: Option<Arc<dyn ShmOps>>,
    /// Numeric id assigned by the provider
    pub id: Option<u32>,
}

impl ShmAllocation {
    /// Allocation with no hooks and no id
    pub fn new(size: usize, sg: ScatterList) -> Self {
        Self { size, sg, ops: None, id: None }
    }
}

impl fmt::Debug for ShmAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmAllocation")
            .field("size", &self.size)
            .field("sg", &self.sg)
            .field("ops", &self.ops.is_some())
            .field("id", &self.id)
            .finish()
    }
}

/// Segment allocator plugin
pub trait ShmProvider: Send + Sync {
    /// Name-space served by this provider
    fn name(&self) -> &str;

    /// Allocate backing for segment `name` of at least `size` bytes
    fn alloc(&self, name: &str, size: usize, flags: ShmFlags) -> ShmResult<ShmAllocation>;

    /// Release backing of a segment this provider allocated
    ///
    /// Called with the segment lock held: must not call back into the
    /// segment's reference operations.
    fn free(&self, shm: &SharedMemory);
}

/// Provider carving segments out of one fixed memory window
///
/// First-fit over a sorted free list; freed ranges are merged with their
/// neighbours.
pub struct CarveoutProvider {
    /// Name-space
    name: String,
    /// Carve-out window
    io: Arc<IoRegion>,
    /// Allocation granularity
    align: usize,
    /// Free ranges as `(offset, len)`, sorted by offset
    free: Mutex<Vec<(usize, usize)>>,
}

impl CarveoutProvider {
    /// Serve `name` from the whole of `io`, aligning segments to `align`
    ///
    /// `align` must be a power of two.
    pub fn new(name: &str, io: Arc<IoRegion>, align: usize) -> ShmResult<Self> {
        if !align.is_power_of_two() {
            return Err(ShmError::InvalidArgument);
        }
        let size = io.size();
        Ok(Self {
            name: String::from(name),
            io,
            align,
            free: Mutex::new(alloc::vec![(0, size)]),
        })
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.free.lock().iter().map(|&(_, len)| len).sum()
    }

    fn release(&self, offset: usize, len: usize) {
        let mut free = self.free.lock();
        let pos = free.partition_point(|&(start, _)| start < offset);
        free.insert(pos, (offset, len));

        if pos + 1 < free.len() && free[pos].0 + free[pos].1 == free[pos + 1].0 {
            free[pos].1 += free[pos + 1].1;
            free.remove(pos + 1);
        }
        if pos > 0 && free[pos - 1].0 + free[pos - 1].1 == free[pos].0 {
            free[pos - 1].1 += free[pos].1;
            free.remove(pos);
        }
    }
}

impl ShmProvider for CarveoutProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, name: &str, size: usize, _flags: ShmFlags) -> ShmResult<ShmAllocation> {
        if size == 0 {
            return Err(ShmError::InvalidArgument);
        }
        let len = align_up(size, self.align);
        let mut free = self.free.lock();
        let slot = free.iter().position(|&(_, avail)| avail >= len).ok_or_else(|| {
            log::warn!("{}: no room for {} ({} bytes)", self.name, name, len);
            ShmError::OutOfMemory
        })?;

        let (offset, avail) = free[slot];
        if avail == len {
            free.remove(slot);
        } else {
            free[slot] = (offset + len, avail - len);
        }
        drop(free);

        log::debug!("{}: carved {} at {:#x} ({} bytes)", self.name, name, offset, len);
        let sg = ScatterList::single(self.io.clone(), offset, len)?;
        Ok(ShmAllocation::new(len, sg))
    }

    fn free(&self, shm: &SharedMemory) {
        if let Some(entry) = shm.scatter_list().first() {
            if Arc::ptr_eq(&entry.io, &self.io) {
                self.release(entry.offset, entry.len);
            }
        }
    }
}

impl fmt::Debug for CarveoutProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarveoutProvider")
            .field("name", &self.name)
            .field("size", &self.io.size())
            .field("available", &self.available())
            .finish()
    }
}
