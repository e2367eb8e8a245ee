//! # Split Ring Layout
//!
//! Byte layout of a legacy split virtqueue: descriptor table, available ring
//! and used ring, the used ring aligned to the transport's alignment.

use amp_hal::align_up;
use static_assertions::const_assert_eq;

/// Virtqueue descriptor flags
pub mod desc_flags {
    /// Marks a buffer as continuing via the next field
    pub const NEXT: u16 = 1;
    /// Marks a buffer as write-only (otherwise read-only)
    pub const WRITE: u16 = 2;
    /// Buffer contains a list of indirect descriptors
    pub const INDIRECT: u16 = 4;
}

/// Virtqueue available ring flags
pub mod avail_flags {
    /// Don't interrupt when the device consumes a buffer
    pub const NO_INTERRUPT: u16 = 1;
}

/// Virtqueue used ring flags
pub mod used_flags {
    /// Don't notify when the driver adds a buffer
    pub const NO_NOTIFY: u16 = 1;
}

/// Virtqueue descriptor
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct VirtqDesc {
    /// Physical address of the buffer
    pub addr: u64,
    /// Length of the buffer
    pub len: u32,
    /// Descriptor flags
    pub flags: u16,
    /// Index of next descriptor in chain
    pub next: u16,
}

/// Virtqueue used element
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct VirtqUsedElem {
    /// Index of the descriptor chain
    pub id: u32,
    /// Length written to the descriptor chain
    pub len: u32,
}

const_assert_eq!(core::mem::size_of::<VirtqDesc>(), 16);
const_assert_eq!(core::mem::size_of::<VirtqUsedElem>(), 8);

/// Field offsets inside a descriptor
pub(crate) mod desc_field {
    pub const ADDR: usize = 0;
    pub const LEN: usize = 8;
    pub const FLAGS: usize = 12;
    pub const NEXT: usize = 14;
}

/// Offsets of the three ring parts, relative to the descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VringLayout {
    /// Number of descriptors
    pub num: u16,
    /// Descriptor table
    pub desc: usize,
    /// Available ring header
    pub avail: usize,
    /// Used ring header
    pub used: usize,
    /// Total bytes
    pub size: usize,
}

impl VringLayout {
    /// Compute the layout for `num` descriptors and used ring alignment `align`
    pub const fn new(num: u16, align: usize) -> Self {
        let n = num as usize;
        let desc = 0;
        let avail = n * core::mem::size_of::<VirtqDesc>();
        // flags, idx, ring[num], used_event
        let avail_end = avail + 4 + n * 2 + 2;
        let used = align_up(avail_end, align);
        // flags, idx, ring[num], avail_event
        let size = used + 4 + n * core::mem::size_of::<VirtqUsedElem>() + 2;
        Self { num, desc, avail, used, size }
    }

    /// Offset of descriptor `i`
    pub const fn desc_at(&self, i: u16) -> usize {
        self.desc + i as usize * core::mem::size_of::<VirtqDesc>()
    }

    /// Offset of the avail ring flags
    pub const fn avail_flags(&self) -> usize {
        self.avail
    }

    /// Offset of the avail ring index
    pub const fn avail_idx(&self) -> usize {
        self.avail + 2
    }

    /// Offset of avail ring slot for running index `idx`
    pub const fn avail_slot(&self, idx: u16) -> usize {
        self.avail + 4 + (idx % self.num) as usize * 2
    }

    /// Offset of the used ring flags
    pub const fn used_flags(&self) -> usize {
        self.used
    }

    /// Offset of the used ring index
    pub const fn used_idx(&self) -> usize {
        self.used + 2
    }

    /// Offset of used ring element for running index `idx`
    pub const fn used_slot(&self, idx: u16) -> usize {
        self.used + 4 + (idx % self.num) as usize * core::mem::size_of::<VirtqUsedElem>()
    }
}

/// Bytes needed by a vring of `num` descriptors
pub const fn vring_size(num: u16, align: usize) -> usize {
    VringLayout::new(num, align).size
}

/// Check if a number is a power of 2
pub const fn is_power_of_2(n: u16) -> bool {
    n != 0 && (n & (n - 1)) == 0
}
