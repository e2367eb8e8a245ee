//! # AMP RPMsg
//!
//! Remote processor messaging over virtio. A host and a remote processor
//! exchange fixed-size message buffers through two virtqueues living in
//! shared memory:
//!
//! ```text
//!            host (virtio driver)                remote (virtio device)
//!   ┌──────────────────────────────┐      ┌──────────────────────────────┐
//!   │ rx = vq0  ◄── used ───────── │ vq0  │ ── avail ──► tx = vq0        │
//!   │ tx = vq1  ─── avail ───────► │ vq1  │ ◄── used ─── rx = vq1        │
//!   └──────────────────────────────┘      └──────────────────────────────┘
//! ```
//!
//! The host owns every buffer: it carves them out of a [`ShmPool`], posts
//! empty ones on its receive queue and full ones on its transmit queue. The
//! remote borrows host buffers for both directions.
//!
//! Messages are routed between [endpoints](endpoint) by 32-bit addresses. An
//! optional name service announces endpoints to the other side.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod device;
pub mod endpoint;
pub mod header;
pub mod pool;

pub use device::{HeldBuffer, ReadyWait, RpmsgVirtioConfig, RpmsgVirtioDevice, TxPayload};
pub use endpoint::{EndpointCallback, EndpointInfo, NsBindCallback, RxMessage};
pub use header::{NsFlags, NsMessage, RpmsgHeader};
pub use pool::ShmPool;

use amp_hal::HalError;
use amp_shmem::ShmError;
use amp_virtio::VirtioError;
use core::fmt;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Default size of one message buffer, header included
pub const RPMSG_BUFFER_SIZE: u32 = 512;

/// Maximum endpoint name length, terminator included
pub const RPMSG_NAME_SIZE: usize = 32;

/// Wildcard address
pub const RPMSG_ADDR_ANY: u32 = 0xFFFF_FFFF;

/// Addresses below this value are never handed out dynamically
pub const RPMSG_RESERVED_ADDRESSES: u32 = 1024;

/// Number of dynamically allocatable addresses
pub const RPMSG_ADDR_BMP_SIZE: u32 = 128;

/// Address of the name service endpoint
pub const RPMSG_NS_EPT_ADDR: u32 = 0x35;

/// Virtio feature bit: the device supports the name service
pub const VIRTIO_RPMSG_F_NS: u32 = 0;

/// Pass to [`RpmsgVirtioDevice::notify_received`] to service every queue
pub const RPMSG_NOTIFY_ALL: u32 = u32::MAX;

// =============================================================================
// ERRORS
// =============================================================================

/// RPMsg result type
pub type RpmsgResult<T> = Result<T, RpmsgError>;

/// Base of the negative RPMsg status codes
pub const RPMSG_ERROR_BASE: i32 = -2000;

/// RPMsg errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpmsgError {
    /// Local allocation failed
    NoMemory,
    /// No message buffer available
    NoBuffer,
    /// Invalid parameter
    Param,
    /// Device not in a state allowing the operation
    DevState,
    /// Payload does not fit in a buffer
    BufferSize,
    /// Device bring-up failed
    Init,
    /// Address unknown, unbound or already taken
    Address,
    /// Operation not permitted
    Permission,
    /// Operation not supported
    NotSupported,
}

impl RpmsgError {
    /// Negative status code
    pub const fn code(self) -> i32 {
        RPMSG_ERROR_BASE
            - match self {
                RpmsgError::NoMemory => 1,
                RpmsgError::NoBuffer => 2,
                RpmsgError::Param => 3,
                RpmsgError::DevState => 4,
                RpmsgError::BufferSize => 5,
                RpmsgError::Init => 6,
                RpmsgError::Address => 7,
                RpmsgError::Permission => 8,
                RpmsgError::NotSupported => 9,
            }
    }
}

impl fmt::Display for RpmsgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpmsgError::NoMemory => write!(f, "No memory"),
            RpmsgError::NoBuffer => write!(f, "No buffer available"),
            RpmsgError::Param => write!(f, "Invalid parameter"),
            RpmsgError::DevState => write!(f, "Invalid device state"),
            RpmsgError::BufferSize => write!(f, "Buffer too small"),
            RpmsgError::Init => write!(f, "Initialization failed"),
            RpmsgError::Address => write!(f, "Bad address"),
            RpmsgError::Permission => write!(f, "Permission denied"),
            RpmsgError::NotSupported => write!(f, "Not supported"),
        }
    }
}

impl From<VirtioError> for RpmsgError {
    fn from(err: VirtioError) -> Self {
        match err {
            VirtioError::QueueFull => RpmsgError::NoBuffer,
            VirtioError::InvalidParameter | VirtioError::InvalidDescriptor => RpmsgError::Param,
            VirtioError::OutOfMemory => RpmsgError::NoMemory,
            VirtioError::NotSupported => RpmsgError::NotSupported,
            VirtioError::QueueNotAvailable => RpmsgError::Init,
            _ => RpmsgError::DevState,
        }
    }
}

impl From<HalError> for RpmsgError {
    fn from(err: HalError) -> Self {
        RpmsgError::from(VirtioError::from(err))
    }
}

impl From<ShmError> for RpmsgError {
    fn from(err: ShmError) -> Self {
        match err {
            ShmError::InvalidArgument | ShmError::NotFound => RpmsgError::Param,
            ShmError::OutOfMemory => RpmsgError::NoMemory,
            ShmError::PermissionDenied => RpmsgError::Permission,
            ShmError::InUse | ShmError::Hardware(_) => RpmsgError::DevState,
        }
    }
}
