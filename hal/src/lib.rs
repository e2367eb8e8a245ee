//! # AMP HAL - Hardware Abstraction Layer
//!
//! Core abstractions for memory shared between processors:
//!
//! - **Addresses**: physical and virtual address newtypes
//! - **I/O regions**: bounds-checked access to a mapped memory window
//! - **Scatter-lists**: one logical buffer described as several sub-regions
//! - **Cache maintenance**: flush/invalidate around device access windows
//!
//! Everything above this crate (shared memory registry, virtio, RPMsg)
//! touches shared memory only through these types.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cache;
pub mod io;
pub mod scatterlist;

pub use cache::{CacheOps, Coherent, DmaDirection};
pub use io::{IoFlags, IoRegion};
pub use scatterlist::{ScatterList, SgEntry, SG_MAX_ENTRIES};

use core::fmt;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported by this region or device
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Hardware reported an error
    HardwareError,
    /// Resource is not available
    ResourceBusy,
    /// Operation timed out
    Timeout,
    /// Address or offset lies outside the region
    InvalidAddress,
    /// Memory allocation failed
    OutOfMemory,
    /// Permission denied
    PermissionDenied,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::NotSupported => write!(f, "Not supported"),
            HalError::InvalidParameter => write!(f, "Invalid parameter"),
            HalError::HardwareError => write!(f, "Hardware error"),
            HalError::ResourceBusy => write!(f, "Resource busy"),
            HalError::Timeout => write!(f, "Timeout"),
            HalError::InvalidAddress => write!(f, "Invalid address"),
            HalError::OutOfMemory => write!(f, "Out of memory"),
            HalError::PermissionDenied => write!(f, "Permission denied"),
        }
    }
}

/// Physical address as seen by the remote side / bus masters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Local virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Create from a pointer
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Convert to a raw pointer
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Convert to a raw mutable pointer
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

/// Align `value` up to `align` (power of two)
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
