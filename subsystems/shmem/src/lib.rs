//! # AMP Shared Memory Subsystem
//!
//! Named shared memory segments that several consumers (local mappings and
//! device attachments) use at the same time:
//!
//! - **Registry**: resolves `"<provider>/<name>"` to a live segment, either a
//!   statically registered one or one allocated on demand by a provider
//! - **References**: every mapping and every device attachment holds one
//!   reference; a segment cannot be closed while references remain
//! - **Devices**: bus-specific attach/detach hooks (IOMMU, DMA mapping)
//! - **Cache sync**: hooks bounding the device/CPU access windows
//!
//! ## Lock Ordering
//!
//! The registry lock is always taken before a segment lock, never the
//! reverse. Hooks run without the segment lock held.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod device;
pub mod name;
pub mod provider;
pub mod registry;
pub mod segment;

pub use device::{Bus, Device, DeviceId};
pub use name::{provider_name, split_name, subname};
pub use provider::{CarveoutProvider, ShmAllocation, ShmProvider};
pub use registry::{registry, ShmRegistry};
pub use segment::{CacheSyncOps, Mapping, RefHandle, SharedMemory, ShmFlags, ShmOps, ShmRef};

use amp_hal::HalError;
use core::fmt;

/// Maximum number of significant bytes in a segment name
pub const SHM_NAME_MAX: usize = 63;

/// Shared memory result type
pub type ShmResult<T> = Result<T, ShmError>;

/// Shared memory errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    /// Malformed name, missing provider, bad parameter
    InvalidArgument,
    /// No segment satisfies the request
    NotFound,
    /// Allocation failed
    OutOfMemory,
    /// Segment still has outstanding references
    InUse,
    /// A hook refused the operation
    PermissionDenied,
    /// A hook reported a hardware failure
    Hardware(HalError),
}

/// `EPERM`
pub const EPERM: i32 = 1;
/// `ENOENT`
pub const ENOENT: i32 = 2;
/// `EIO`
pub const EIO: i32 = 5;
/// `ENOMEM`
pub const ENOMEM: i32 = 12;
/// `EINVAL`
pub const EINVAL: i32 = 22;

impl ShmError {
    /// Negative errno equivalent
    pub const fn errno(self) -> i32 {
        match self {
            ShmError::InvalidArgument | ShmError::InUse => -EINVAL,
            ShmError::NotFound => -ENOENT,
            ShmError::OutOfMemory => -ENOMEM,
            ShmError::PermissionDenied => -EPERM,
            ShmError::Hardware(_) => -EIO,
        }
    }
}

impl From<HalError> for ShmError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::InvalidParameter | HalError::InvalidAddress => ShmError::InvalidArgument,
            HalError::OutOfMemory => ShmError::OutOfMemory,
            HalError::PermissionDenied => ShmError::PermissionDenied,
            other => ShmError::Hardware(other),
        }
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidArgument => write!(f, "Invalid argument"),
            ShmError::NotFound => write!(f, "No such segment"),
            ShmError::OutOfMemory => write!(f, "Out of memory"),
            ShmError::InUse => write!(f, "Segment in use"),
            ShmError::PermissionDenied => write!(f, "Permission denied"),
            ShmError::Hardware(err) => write!(f, "Hardware failure: {}", err),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use amp_hal::{IoFlags, IoRegion, PhysAddr};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec;

    /// Heap memory standing in for a DDR carve-out
    pub fn region(size: usize) -> Arc<IoRegion> {
        let mem = Box::leak(vec![0u8; size].into_boxed_slice());
        Arc::new(IoRegion::from_static(mem, Some(PhysAddr::new(0x3ed0_0000)), IoFlags::NON_CACHED))
    }
}
