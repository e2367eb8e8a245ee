//! # Split Virtqueue
//!
//! A split virtqueue whose rings live in an [`IoRegion`] shared by both
//! processors. The driver side posts buffers on the available ring and
//! collects them back from the used ring; the device side does the reverse.
//!
//! Buffer addresses on the ring are physical addresses. All ring state that
//! is private to one side (free list, shadow indices, cookies) lives in the
//! [`Virtqueue`] itself.

use crate::ring::{avail_flags, desc_field, desc_flags, is_power_of_2, used_flags, VringLayout};
use crate::{VirtioDevice, VirtioError, VirtioResult, VirtioRole, VringInfo};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use amp_hal::{IoRegion, PhysAddr};
use core::sync::atomic::{fence, Ordering};

/// One element of a buffer posted by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VqSegment {
    /// Physical address of the data
    pub addr: PhysAddr,
    /// Length in bytes
    pub len: u32,
    /// The device writes into this segment
    pub writable: bool,
}

/// A buffer the device has returned to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedBuffer {
    /// Cookie given to [`Virtqueue::add_buffer`]
    pub cookie: usize,
    /// Bytes the device wrote
    pub len: u32,
}

/// A buffer the driver has made available to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailBuffer {
    /// Head descriptor index, handed back in [`Virtqueue::add_consumed_buffer`]
    pub head: u16,
    /// Physical address of the first segment
    pub addr: PhysAddr,
    /// Length of the first segment
    pub len: u32,
}

/// Split virtqueue over shared memory
#[derive(Debug)]
pub struct Virtqueue {
    /// Queue name
    name: &'static str,
    /// Index within the device
    index: u16,
    /// Identifier for kicks
    notify_id: u32,
    /// Side of the ring we drive
    role: VirtioRole,
    /// Region holding the rings
    io: Arc<IoRegion>,
    /// Ring base within `io`
    base: usize,
    /// Ring layout
    layout: VringLayout,

    // Driver state
    /// Head of the descriptor free list
    free_head: u16,
    /// Free descriptors
    num_free: u16,
    /// Shadow of `next` for every descriptor
    desc_next: Vec<u16>,
    /// Descriptors per outstanding chain, indexed by head
    chain_len: Vec<u16>,
    /// Cookie per outstanding chain, indexed by head
    cookies: Vec<Option<usize>>,
    /// Shadow of avail.idx
    avail_idx: u16,
    /// Next used entry to consume
    last_used_idx: u16,

    // Device state
    /// Next available entry to consume
    last_avail_idx: u16,
    /// Shadow of used.idx
    used_idx: u16,
}

impl Virtqueue {
    /// Bind a virtqueue to the vring described by `info`
    ///
    /// The driver side resets the ring memory; the device side picks up the
    /// ring as the driver left it.
    pub fn new(
        name: &'static str,
        index: u16,
        info: VringInfo,
        role: VirtioRole,
    ) -> VirtioResult<Self> {
        if !is_power_of_2(info.num) || !info.align.is_power_of_two() {
            log::error!("virtqueue {}: bad geometry num={} align={}", name, info.num, info.align);
            return Err(VirtioError::InvalidParameter);
        }
        let layout = VringLayout::new(info.num, info.align);
        info.io.check(info.offset, layout.size)?;

        let num = info.num;
        let mut vq = Self {
            name,
            index,
            notify_id: info.notify_id,
            role,
            io: info.io,
            base: info.offset,
            layout,
            free_head: 0,
            num_free: num,
            desc_next: (1..=num).collect(),
            chain_len: vec![0; num as usize],
            cookies: vec![None; num as usize],
            avail_idx: 0,
            last_used_idx: 0,
            last_avail_idx: 0,
            used_idx: 0,
        };

        if role == VirtioRole::Driver {
            vq.io.block_set(vq.base, 0, layout.size)?;
            for i in 0..num {
                vq.io.write16(vq.base + layout.desc_at(i) + desc_field::NEXT, vq.desc_next[i as usize])?;
            }
            vq.sync_out(0, layout.size);
        } else {
            vq.sync_in(0, layout.size);
            vq.last_avail_idx = vq.read16(layout.used_idx())?;
            vq.used_idx = vq.last_avail_idx;
        }

        log::debug!(
            "virtqueue {}[{}]: {} descriptors at {:#x} ({:?})",
            name,
            index,
            num,
            vq.base,
            role
        );
        Ok(vq)
    }

    /// Queue name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Index within the device
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Notification identifier
    pub fn notify_id(&self) -> u32 {
        self.notify_id
    }

    /// Number of descriptors
    pub fn num(&self) -> u16 {
        self.layout.num
    }

    /// Side of the ring this queue drives
    pub fn role(&self) -> VirtioRole {
        self.role
    }

    /// Free descriptors (driver side)
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// No descriptor left to post (driver side)
    pub fn is_full(&self) -> bool {
        self.num_free == 0
    }

    /// Nothing outstanding on the device (driver side)
    pub fn is_empty(&self) -> bool {
        self.num_free == self.layout.num
    }

    // =========================================================================
    // Ring access
    // =========================================================================

    fn read16(&self, offset: usize) -> VirtioResult<u16> {
        Ok(self.io.read16(self.base + offset)?)
    }

    fn write16(&self, offset: usize, value: u16) -> VirtioResult<()> {
        Ok(self.io.write16(self.base + offset, value)?)
    }

    fn read32(&self, offset: usize) -> VirtioResult<u32> {
        Ok(self.io.read32(self.base + offset)?)
    }

    fn write32(&self, offset: usize, value: u32) -> VirtioResult<()> {
        Ok(self.io.write32(self.base + offset, value)?)
    }

    cfg_if::cfg_if! {
        if #[cfg(feature = "dcache")] {
            fn sync_out(&self, offset: usize, len: usize) {
                self.io.flush(self.base + offset, len);
            }

            fn sync_in(&self, offset: usize, len: usize) {
                self.io.invalidate(self.base + offset, len);
            }
        } else {
            #[inline(always)]
            fn sync_out(&self, _offset: usize, _len: usize) {}

            #[inline(always)]
            fn sync_in(&self, _offset: usize, _len: usize) {}
        }
    }

    fn write_desc(&self, idx: u16, addr: PhysAddr, len: u32, flags: u16, next: u16) -> VirtioResult<()> {
        let off = self.layout.desc_at(idx);
        self.io.write64(self.base + off + desc_field::ADDR, addr.as_u64())?;
        self.write32(off + desc_field::LEN, len)?;
        self.write16(off + desc_field::FLAGS, flags)?;
        self.write16(off + desc_field::NEXT, next)?;
        self.sync_out(off, 16);
        Ok(())
    }

    // =========================================================================
    // Driver side
    // =========================================================================

    /// Post a buffer made of `segments` to the device
    ///
    /// `cookie` is returned by [`Virtqueue::get_buffer`] once the device is
    /// done with the buffer. Returns the head descriptor index.
    pub fn add_buffer(&mut self, segments: &[VqSegment], cookie: usize) -> VirtioResult<u16> {
        if self.role != VirtioRole::Driver {
            return Err(VirtioError::NotSupported);
        }
        if segments.is_empty() {
            return Err(VirtioError::InvalidParameter);
        }
        if segments.len() > self.num_free as usize {
            return Err(VirtioError::QueueFull);
        }

        let head = self.free_head;
        let mut idx = head;
        for (i, seg) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            let next = self.desc_next[idx as usize];
            let mut flags = if seg.writable { desc_flags::WRITE } else { 0 };
            if !last {
                flags |= desc_flags::NEXT;
            }
            self.write_desc(idx, seg.addr, seg.len, flags, next)?;
            if !last {
                idx = next;
            }
        }
        self.free_head = self.desc_next[idx as usize];
        self.num_free -= segments.len() as u16;
        self.chain_len[head as usize] = segments.len() as u16;
        self.cookies[head as usize] = Some(cookie);

        let slot = self.layout.avail_slot(self.avail_idx);
        self.write16(slot, head)?;
        self.sync_out(slot, 2);
        fence(Ordering::Release);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.write16(self.layout.avail_idx(), self.avail_idx)?;
        self.sync_out(self.layout.avail_idx(), 2);

        log::trace!("virtqueue {}: posted head {} ({} segs)", self.name, head, segments.len());
        Ok(head)
    }

    /// Collect the next buffer the device has returned
    pub fn get_buffer(&mut self) -> Option<UsedBuffer> {
        if self.role != VirtioRole::Driver {
            return None;
        }
        self.sync_in(self.layout.used_idx(), 2);
        let used_idx = self.read16(self.layout.used_idx()).ok()?;
        if used_idx == self.last_used_idx {
            return None;
        }
        fence(Ordering::Acquire);

        let slot = self.layout.used_slot(self.last_used_idx);
        self.sync_in(slot, 8);
        let id = self.read32(slot).ok()?;
        let len = self.read32(slot + 4).ok()?;
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let head = id as usize;
        let cookie = match self.cookies.get_mut(head).and_then(Option::take) {
            Some(cookie) => cookie,
            None => {
                log::error!("virtqueue {}: device returned bogus head {}", self.name, id);
                return None;
            }
        };

        // Return the chain to the free list
        let count = self.chain_len[head];
        let mut tail = head as u16;
        for _ in 1..count {
            tail = self.desc_next[tail as usize];
        }
        self.desc_next[tail as usize] = self.free_head;
        self.free_head = head as u16;
        self.num_free += count;
        self.chain_len[head] = 0;

        Some(UsedBuffer { cookie, len })
    }

    // =========================================================================
    // Device side
    // =========================================================================

    /// Take the next buffer the driver made available
    pub fn get_available_buffer(&mut self) -> Option<AvailBuffer> {
        if self.role != VirtioRole::Device {
            return None;
        }
        self.sync_in(self.layout.avail_idx(), 2);
        let avail_idx = self.read16(self.layout.avail_idx()).ok()?;
        if avail_idx == self.last_avail_idx {
            return None;
        }
        fence(Ordering::Acquire);

        let slot = self.layout.avail_slot(self.last_avail_idx);
        self.sync_in(slot, 2);
        let head = self.read16(slot).ok()?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        if head >= self.layout.num {
            log::error!("virtqueue {}: driver posted bogus head {}", self.name, head);
            return None;
        }

        let off = self.layout.desc_at(head);
        self.sync_in(off, 16);
        let addr = self.io.read64(self.base + off + desc_field::ADDR).ok()?;
        let len = self.read32(off + desc_field::LEN).ok()?;
        Some(AvailBuffer { head, addr: PhysAddr::new(addr), len })
    }

    /// Length of the next available buffer, without taking it
    pub fn next_available_length(&self) -> Option<u32> {
        if self.role != VirtioRole::Device {
            return None;
        }
        self.sync_in(self.layout.avail_idx(), 2);
        let avail_idx = self.read16(self.layout.avail_idx()).ok()?;
        if avail_idx == self.last_avail_idx {
            return None;
        }
        fence(Ordering::Acquire);
        let slot = self.layout.avail_slot(self.last_avail_idx);
        self.sync_in(slot, 2);
        let head = self.read16(slot).ok()?;
        self.buffer_length(head).ok()
    }

    /// Length of the buffer starting at descriptor `head`
    pub fn buffer_length(&self, head: u16) -> VirtioResult<u32> {
        if head >= self.layout.num {
            return Err(VirtioError::InvalidDescriptor);
        }
        let off = self.layout.desc_at(head) + desc_field::LEN;
        self.sync_in(off, 4);
        self.read32(off)
    }

    /// Hand buffer `head` back to the driver with `len` bytes written
    pub fn add_consumed_buffer(&mut self, head: u16, len: u32) -> VirtioResult<()> {
        if self.role != VirtioRole::Device {
            return Err(VirtioError::NotSupported);
        }
        if head >= self.layout.num {
            return Err(VirtioError::InvalidDescriptor);
        }
        let slot = self.layout.used_slot(self.used_idx);
        self.write32(slot, head as u32)?;
        self.write32(slot + 4, len)?;
        self.sync_out(slot, 8);
        fence(Ordering::Release);
        self.used_idx = self.used_idx.wrapping_add(1);
        self.write16(self.layout.used_idx(), self.used_idx)?;
        self.sync_out(self.layout.used_idx(), 2);
        Ok(())
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Ask the other side not to signal us
    pub fn disable_cb(&self) -> VirtioResult<()> {
        self.set_suppress(true)
    }

    /// Ask the other side to signal us again
    pub fn enable_cb(&self) -> VirtioResult<()> {
        self.set_suppress(false)
    }

    fn set_suppress(&self, suppress: bool) -> VirtioResult<()> {
        let (offset, bit) = match self.role {
            VirtioRole::Driver => (self.layout.avail_flags(), avail_flags::NO_INTERRUPT),
            VirtioRole::Device => (self.layout.used_flags(), used_flags::NO_NOTIFY),
        };
        self.write16(offset, if suppress { bit } else { 0 })?;
        self.sync_out(offset, 2);
        Ok(())
    }

    /// Whether the other side wants to be signalled
    pub fn needs_kick(&self) -> bool {
        let (offset, bit) = match self.role {
            VirtioRole::Driver => (self.layout.used_flags(), used_flags::NO_NOTIFY),
            VirtioRole::Device => (self.layout.avail_flags(), avail_flags::NO_INTERRUPT),
        };
        fence(Ordering::SeqCst);
        self.sync_in(offset, 2);
        self.read16(offset).map_or(true, |flags| flags & bit == 0)
    }

    /// Signal the other side through `vdev` unless it suppressed signals
    pub fn kick(&self, vdev: &dyn VirtioDevice) -> bool {
        if !self.needs_kick() {
            return false;
        }
        vdev.notify(self.notify_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{region, SHM_PHYS};

    fn info(io: &Arc<IoRegion>, num: u16) -> VringInfo {
        VringInfo { io: io.clone(), offset: 0, num, align: 16, notify_id: 3 }
    }

    fn pair(num: u16) -> (Virtqueue, Virtqueue) {
        let io = region(0x1000);
        let driver = Virtqueue::new("tx", 0, info(&io, num), VirtioRole::Driver).unwrap();
        let device = Virtqueue::new("rx", 0, info(&io, num), VirtioRole::Device).unwrap();
        (driver, device)
    }

    fn seg(addr: u64, len: u32) -> VqSegment {
        VqSegment { addr: PhysAddr::new(addr), len, writable: true }
    }

    #[test]
    fn test_round_trip() {
        let (mut driver, mut device) = pair(4);
        assert!(device.get_available_buffer().is_none());

        let head = driver.add_buffer(&[seg(SHM_PHYS + 0x800, 512)], 0xabc).unwrap();
        assert_eq!(driver.num_free(), 3);

        let buf = device.get_available_buffer().unwrap();
        assert_eq!(buf.head, head);
        assert_eq!(buf.addr, PhysAddr::new(SHM_PHYS + 0x800));
        assert_eq!(buf.len, 512);
        assert_eq!(device.buffer_length(head).unwrap(), 512);
        assert!(driver.get_buffer().is_none());

        device.add_consumed_buffer(buf.head, 40).unwrap();
        let used = driver.get_buffer().unwrap();
        assert_eq!(used, UsedBuffer { cookie: 0xabc, len: 40 });
        assert!(driver.is_empty());
    }

    #[test]
    fn test_peek_available_length() {
        let (mut driver, mut device) = pair(4);
        assert_eq!(device.next_available_length(), None);
        driver.add_buffer(&[seg(SHM_PHYS + 0x800, 256)], 1).unwrap();
        driver.add_buffer(&[seg(SHM_PHYS + 0x900, 128)], 2).unwrap();

        // Peeking does not consume
        assert_eq!(device.next_available_length(), Some(256));
        assert_eq!(device.next_available_length(), Some(256));
        assert_eq!(device.get_available_buffer().unwrap().len, 256);
        assert_eq!(device.next_available_length(), Some(128));
        device.get_available_buffer().unwrap();
        assert_eq!(device.next_available_length(), None);
        assert_eq!(driver.next_available_length(), None);
    }

    #[test]
    fn test_full_queue() {
        let (mut driver, _device) = pair(2);
        driver.add_buffer(&[seg(SHM_PHYS, 16)], 1).unwrap();
        driver.add_buffer(&[seg(SHM_PHYS + 16, 16)], 2).unwrap();
        assert!(driver.is_full());
        assert_eq!(driver.add_buffer(&[seg(SHM_PHYS, 16)], 3), Err(VirtioError::QueueFull));
    }

    #[test]
    fn test_chains_recycle_descriptors() {
        let (mut driver, mut device) = pair(4);
        for round in 0..10usize {
            driver
                .add_buffer(&[seg(SHM_PHYS, 8), seg(SHM_PHYS + 8, 8), seg(SHM_PHYS + 16, 8)], round)
                .unwrap();
            assert_eq!(driver.num_free(), 1);
            let buf = device.get_available_buffer().unwrap();
            assert_eq!(buf.len, 8);
            device.add_consumed_buffer(buf.head, 0).unwrap();
            assert_eq!(driver.get_buffer().unwrap().cookie, round);
            assert_eq!(driver.num_free(), 4);
        }
    }

    #[test]
    fn test_wrong_side_rejected() {
        let (mut driver, mut device) = pair(4);
        assert_eq!(device.add_buffer(&[seg(SHM_PHYS, 8)], 0), Err(VirtioError::NotSupported));
        assert_eq!(driver.add_consumed_buffer(0, 0), Err(VirtioError::NotSupported));
        assert_eq!(device.add_consumed_buffer(9, 0), Err(VirtioError::InvalidDescriptor));
        assert_eq!(driver.add_buffer(&[], 0), Err(VirtioError::InvalidParameter));
    }

    #[test]
    fn test_bad_geometry() {
        let io = region(0x1000);
        assert_eq!(
            Virtqueue::new("q", 0, info(&io, 3), VirtioRole::Driver).unwrap_err(),
            VirtioError::InvalidParameter
        );
        assert_eq!(
            Virtqueue::new("q", 0, info(&io, 256), VirtioRole::Driver).unwrap_err(),
            VirtioError::InvalidParameter
        );
    }

    #[test]
    fn test_suppression() {
        let (driver, device) = pair(4);
        assert!(driver.needs_kick());
        assert!(device.needs_kick());
        device.disable_cb().unwrap();
        assert!(!driver.needs_kick());
        driver.disable_cb().unwrap();
        assert!(!device.needs_kick());
        device.enable_cb().unwrap();
        assert!(driver.needs_kick());
    }
}
