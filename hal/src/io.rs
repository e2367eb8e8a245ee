//! # I/O Regions
//!
//! An [`IoRegion`] is a window of memory mapped into the local address space
//! that may also be reachable by other bus masters (remote cores, DMA
//! engines). All offsets are relative to the start of the region and every
//! access is bounds checked.

use crate::{CacheOps, DmaDirection, HalError, HalResult, PhysAddr, VirtAddr};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

bitflags! {
    /// Memory attributes of an I/O region
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoFlags: u32 {
        /// Mapped cacheable; accesses shared with other masters need maintenance
        const CACHED = 1 << 0;
        /// Mapped non-cacheable
        const NON_CACHED = 1 << 1;
        /// Device (MMIO) memory
        const DEVICE = 1 << 2;
    }
}

/// Physical address translation of a region
#[derive(Debug, Clone)]
enum PhysMap {
    /// No physical address known (purely local memory)
    None,
    /// Physically contiguous starting at the given address
    Linear(PhysAddr),
    /// One physical address per page of `1 << page_shift` bytes
    Paged { page_shift: u32, pages: Vec<PhysAddr> },
}

/// A bounds-checked window onto shared or device memory
pub struct IoRegion {
    /// Local mapping
    virt: NonNull<u8>,
    /// Size in bytes
    size: usize,
    /// Physical translation
    phys: PhysMap,
    /// Memory attributes
    flags: IoFlags,
    /// Cache maintenance for cacheable mappings
    cache: Option<Arc<dyn CacheOps>>,
}

// SAFETY: the region only hands out copies or bounds-checked raw accesses;
// concurrent users of the underlying memory synchronise through the
// protocols built on top (virtqueues, segment references).
unsafe impl Send for IoRegion {}
unsafe impl Sync for IoRegion {}

impl IoRegion {
    /// Create a region over an existing, physically contiguous mapping
    ///
    /// # Safety
    /// `virt` must be valid for reads and writes of `size` bytes for the
    /// whole lifetime of the region.
    pub unsafe fn from_raw(
        virt: *mut u8,
        size: usize,
        phys: Option<PhysAddr>,
        flags: IoFlags,
    ) -> HalResult<Self> {
        let virt = NonNull::new(virt).ok_or(HalError::InvalidParameter)?;
        Ok(Self {
            virt,
            size,
            phys: phys.map_or(PhysMap::None, PhysMap::Linear),
            flags,
            cache: None,
        })
    }

    /// Create a region whose pages are scattered in physical memory
    ///
    /// # Safety
    /// Same requirements as [`IoRegion::from_raw`].
    pub unsafe fn from_raw_paged(
        virt: *mut u8,
        size: usize,
        page_shift: u32,
        pages: Vec<PhysAddr>,
        flags: IoFlags,
    ) -> HalResult<Self> {
        let virt = NonNull::new(virt).ok_or(HalError::InvalidParameter)?;
        if page_shift >= usize::BITS || pages.is_empty() {
            return Err(HalError::InvalidParameter);
        }
        let covered = pages.len().saturating_mul(1usize << page_shift);
        if covered < size {
            log::error!(
                "io: {} pages of {:#x} bytes cannot map {:#x} bytes",
                pages.len(),
                1usize << page_shift,
                size
            );
            return Err(HalError::InvalidParameter);
        }
        Ok(Self {
            virt,
            size,
            phys: PhysMap::Paged { page_shift, pages },
            flags,
            cache: None,
        })
    }

    /// Create a region over statically reserved memory
    pub fn from_static(mem: &'static mut [u8], phys: Option<PhysAddr>, flags: IoFlags) -> Self {
        let size = mem.len();
        Self {
            virt: NonNull::from(mem).cast(),
            size,
            phys: phys.map_or(PhysMap::None, PhysMap::Linear),
            flags,
            cache: None,
        }
    }

    /// Attach cache maintenance operations
    pub fn with_cache(mut self, cache: Arc<dyn CacheOps>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Memory attributes
    #[inline]
    pub fn flags(&self) -> IoFlags {
        self.flags
    }

    /// Whether accesses need cache maintenance
    #[inline]
    pub fn is_cached(&self) -> bool {
        self.flags.contains(IoFlags::CACHED)
    }

    /// Check that `[offset, offset + len)` lies inside the region
    pub fn check(&self, offset: usize, len: usize) -> HalResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(HalError::InvalidAddress),
        }
    }

    /// Local address of `offset`
    pub fn virt(&self, offset: usize) -> Option<VirtAddr> {
        (offset < self.size).then(|| VirtAddr::new(self.virt.as_ptr() as usize + offset))
    }

    /// Offset of a local address inside the region
    pub fn virt_to_offset(&self, virt: VirtAddr) -> Option<usize> {
        let offset = virt.as_usize().checked_sub(self.virt.as_ptr() as usize)?;
        (offset < self.size).then_some(offset)
    }

    /// Physical address of `offset`
    pub fn phys(&self, offset: usize) -> Option<PhysAddr> {
        if offset >= self.size {
            return None;
        }
        match &self.phys {
            PhysMap::None => None,
            PhysMap::Linear(base) => Some(base.add(offset as u64)),
            PhysMap::Paged { page_shift, pages } => {
                let page = pages.get(offset >> page_shift)?;
                let mask = (1usize << page_shift) - 1;
                Some(page.add((offset & mask) as u64))
            }
        }
    }

    /// Offset of a physical address inside the region
    pub fn phys_to_offset(&self, phys: PhysAddr) -> Option<usize> {
        match &self.phys {
            PhysMap::None => None,
            PhysMap::Linear(base) => {
                let offset = phys.as_u64().checked_sub(base.as_u64())?;
                let offset = usize::try_from(offset).ok()?;
                (offset < self.size).then_some(offset)
            }
            PhysMap::Paged { page_shift, pages } => {
                let page_size = 1u64 << page_shift;
                pages.iter().enumerate().find_map(|(index, page)| {
                    let delta = phys.as_u64().checked_sub(page.as_u64())?;
                    if delta >= page_size {
                        return None;
                    }
                    let offset = (index << page_shift) + delta as usize;
                    (offset < self.size).then_some(offset)
                })
            }
        }
    }

    /// Translate a physical address to a local one
    pub fn phys_to_virt(&self, phys: PhysAddr) -> Option<VirtAddr> {
        self.phys_to_offset(phys).and_then(|offset| self.virt(offset))
    }

    /// Translate a local address to a physical one
    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.virt_to_offset(virt).and_then(|offset| self.phys(offset))
    }

    fn read<T: Copy>(&self, offset: usize) -> HalResult<T> {
        self.check(offset, size_of::<T>())?;
        // SAFETY: bounds checked above.
        let ptr = unsafe { self.virt.as_ptr().add(offset) }.cast::<T>();
        // SAFETY: ptr is inside the mapping; alignment is handled explicitly.
        let value = unsafe {
            if (ptr as usize) % align_of::<T>() == 0 {
                ptr.read_volatile()
            } else {
                ptr.read_unaligned()
            }
        };
        Ok(value)
    }

    fn write<T: Copy>(&self, offset: usize, value: T) -> HalResult<()> {
        self.check(offset, size_of::<T>())?;
        // SAFETY: bounds checked above.
        let ptr = unsafe { self.virt.as_ptr().add(offset) }.cast::<T>();
        // SAFETY: ptr is inside the mapping; alignment is handled explicitly.
        unsafe {
            if (ptr as usize) % align_of::<T>() == 0 {
                ptr.write_volatile(value);
            } else {
                ptr.write_unaligned(value);
            }
        }
        Ok(())
    }

    /// Read a byte
    pub fn read8(&self, offset: usize) -> HalResult<u8> {
        self.read(offset)
    }

    /// Read a 16-bit value (native endian)
    pub fn read16(&self, offset: usize) -> HalResult<u16> {
        self.read(offset)
    }

    /// Read a 32-bit value (native endian)
    pub fn read32(&self, offset: usize) -> HalResult<u32> {
        self.read(offset)
    }

    /// Read a 64-bit value (native endian)
    pub fn read64(&self, offset: usize) -> HalResult<u64> {
        self.read(offset)
    }

    /// Write a byte
    pub fn write8(&self, offset: usize, value: u8) -> HalResult<()> {
        self.write(offset, value)
    }

    /// Write a 16-bit value (native endian)
    pub fn write16(&self, offset: usize, value: u16) -> HalResult<()> {
        self.write(offset, value)
    }

    /// Write a 32-bit value (native endian)
    pub fn write32(&self, offset: usize, value: u32) -> HalResult<()> {
        self.write(offset, value)
    }

    /// Write a 64-bit value (native endian)
    pub fn write64(&self, offset: usize, value: u64) -> HalResult<()> {
        self.write(offset, value)
    }

    /// Copy out of the region
    ///
    /// The copy is clamped to the end of the region; returns the number of
    /// bytes read. Starting past the end is an error.
    pub fn block_read(&self, offset: usize, dst: &mut [u8]) -> HalResult<usize> {
        let len = self.clamp(offset, dst.len())?;
        // SAFETY: [offset, offset + len) is inside the mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(self.virt.as_ptr().add(offset), dst.as_mut_ptr(), len);
        }
        Ok(len)
    }

    /// Copy into the region
    ///
    /// Clamped like [`IoRegion::block_read`]; returns the number of bytes written.
    pub fn block_write(&self, offset: usize, src: &[u8]) -> HalResult<usize> {
        let len = self.clamp(offset, src.len())?;
        // SAFETY: [offset, offset + len) is inside the mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.virt.as_ptr().add(offset), len);
        }
        Ok(len)
    }

    /// Fill part of the region with `value`
    pub fn block_set(&self, offset: usize, value: u8, len: usize) -> HalResult<usize> {
        let len = self.clamp(offset, len)?;
        // SAFETY: [offset, offset + len) is inside the mapping.
        unsafe {
            core::ptr::write_bytes(self.virt.as_ptr().add(offset), value, len);
        }
        Ok(len)
    }

    fn clamp(&self, offset: usize, len: usize) -> HalResult<usize> {
        if offset >= self.size {
            log::warn!("io: block access at {:#x} past region end {:#x}", offset, self.size);
            return Err(HalError::InvalidAddress);
        }
        let avail = self.size - offset;
        if len > avail {
            log::debug!("io: block access at {:#x} clamped from {} to {} bytes", offset, len, avail);
        }
        Ok(len.min(avail))
    }

    /// Borrow part of the region as a byte slice
    ///
    /// # Safety
    /// The caller must guarantee no other master writes the range while the
    /// slice is alive (for example because the buffer is owned by the local
    /// side of a virtqueue).
    pub unsafe fn slice(&self, offset: usize, len: usize) -> HalResult<&[u8]> {
        self.check(offset, len)?;
        // SAFETY: range is inside the mapping; exclusivity is the caller's.
        Ok(unsafe { core::slice::from_raw_parts(self.virt.as_ptr().add(offset), len) })
    }

    /// Write back cached data in `[offset, offset + len)`
    pub fn flush(&self, offset: usize, len: usize) {
        if let (Some(cache), Some(virt)) = (self.cache.as_ref(), self.virt(offset)) {
            cache.flush(virt, len.min(self.size - offset));
        }
    }

    /// Discard cached data in `[offset, offset + len)`
    pub fn invalidate(&self, offset: usize, len: usize) {
        if let (Some(cache), Some(virt)) = (self.cache.as_ref(), self.virt(offset)) {
            cache.invalidate(virt, len.min(self.size - offset));
        }
    }

    /// Hand `[offset, offset + len)` over to a device
    pub fn sync_for_device(&self, offset: usize, len: usize, dir: DmaDirection) {
        if let (Some(cache), Some(virt)) = (self.cache.as_ref(), self.virt(offset)) {
            cache.sync_for_device(virt, len.min(self.size - offset), dir);
        }
    }

    /// Take `[offset, offset + len)` back from a device
    pub fn sync_for_cpu(&self, offset: usize, len: usize, dir: DmaDirection) {
        if let (Some(cache), Some(virt)) = (self.cache.as_ref(), self.virt(offset)) {
            cache.sync_for_cpu(virt, len.min(self.size - offset), dir);
        }
    }
}

impl fmt::Debug for IoRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRegion")
            .field("virt", &self.virt)
            .field("size", &self.size)
            .field("phys", &self.phys)
            .field("flags", &self.flags)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}
