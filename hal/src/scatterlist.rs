//! # Scatter-Lists
//!
//! A scatter-list describes one logical buffer as up to [`SG_MAX_ENTRIES`]
//! sub-regions, each a range inside an [`IoRegion`]. It is the value passed
//! between the shared memory registry, device attachments and transports.

use crate::{HalError, HalResult, IoRegion, PhysAddr, VirtAddr};
use alloc::sync::Arc;
use arrayvec::ArrayVec;

/// Maximum number of entries in one scatter-list
pub const SG_MAX_ENTRIES: usize = 8;

/// One contiguous piece of a scatter-list
#[derive(Debug, Clone)]
pub struct SgEntry {
    /// Region holding this piece
    pub io: Arc<IoRegion>,
    /// Offset inside the region
    pub offset: usize,
    /// Length in bytes
    pub len: usize,
}

impl SgEntry {
    /// Create an entry, checking that it fits in `io`
    pub fn new(io: Arc<IoRegion>, offset: usize, len: usize) -> HalResult<Self> {
        io.check(offset, len)?;
        Ok(Self { io, offset, len })
    }

    /// Local address of the first byte
    pub fn virt(&self) -> Option<VirtAddr> {
        self.io.virt(self.offset)
    }

    /// Physical address of the first byte
    pub fn phys(&self) -> Option<PhysAddr> {
        self.io.phys(self.offset)
    }
}

impl PartialEq for SgEntry {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.io, &other.io) && self.offset == other.offset && self.len == other.len
    }
}

impl Eq for SgEntry {}

/// A buffer described by one or more [`SgEntry`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterList {
    entries: ArrayVec<SgEntry, SG_MAX_ENTRIES>,
}

impl ScatterList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// A list with a single entry covering `[offset, offset + len)` of `io`
    pub fn single(io: Arc<IoRegion>, offset: usize, len: usize) -> HalResult<Self> {
        let mut sg = Self::new();
        sg.push(SgEntry::new(io, offset, len)?)?;
        Ok(sg)
    }

    /// A list covering the whole of `io`
    pub fn whole(io: Arc<IoRegion>) -> Self {
        let len = io.size();
        let mut entries = ArrayVec::new();
        entries.push(SgEntry { io, offset: 0, len });
        Self { entries }
    }

    /// Append an entry
    pub fn push(&mut self, entry: SgEntry) -> HalResult<()> {
        self.entries.try_push(entry).map_err(|_| HalError::OutOfMemory)
    }

    /// Entries in order
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of bytes described
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(|e| e.len).sum()
    }

    /// First entry, which most single-region users care about
    pub fn first(&self) -> Option<&SgEntry> {
        self.entries.first()
    }
}
