//! # AMP Virtio
//!
//! The virtio pieces an inter-processor transport needs:
//!
//! - The [`VirtioDevice`] contract: status, feature negotiation, config space,
//!   vring discovery and notification (kick)
//! - [`Virtqueue`]: split virtqueues living in shared memory, usable from the
//!   driver (host) or the device (remote) side
//! - [`RprocVirtioDevice`]: a virtio device described by a remoteproc
//!   resource table entry shared between both processors
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  Consumers        │  RPMsg  │  ...                            │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Virtqueue        │  Split ring (desc / avail / used)         │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Device           │  Remoteproc resource table  │  custom     │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Memory           │  IoRegion (shared DDR / OCM)              │
//! └───────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod ring;
pub mod rproc;
pub mod virtqueue;

pub use rproc::{Notifier, RprocVirtioDevice, VdevResource, VringResource};
pub use virtqueue::{AvailBuffer, UsedBuffer, Virtqueue, VqSegment};

use alloc::sync::Arc;
use alloc::vec::Vec;
use amp_hal::{HalError, IoRegion};
use core::fmt;

// =============================================================================
// VIRTIO DEVICE TYPES
// =============================================================================

/// Virtio device types relevant to inter-processor communication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VirtioDeviceType {
    /// Invalid device
    Invalid = 0,
    /// Console device
    Console = 3,
    /// RPMSG device
    Rpmsg = 7,
    /// RPROC serial
    RprocSerial = 11,
}

impl VirtioDeviceType {
    /// Get device type name
    pub const fn name(&self) -> &'static str {
        match self {
            VirtioDeviceType::Invalid => "Invalid",
            VirtioDeviceType::Console => "Console",
            VirtioDeviceType::Rpmsg => "RPMSG",
            VirtioDeviceType::RprocSerial => "RPROC Serial",
        }
    }

    /// Convert from u32
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(VirtioDeviceType::Invalid),
            3 => Some(VirtioDeviceType::Console),
            7 => Some(VirtioDeviceType::Rpmsg),
            11 => Some(VirtioDeviceType::RprocSerial),
            _ => None,
        }
    }
}

impl fmt::Display for VirtioDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// VIRTIO DEVICE STATUS
// =============================================================================

/// VirtIO device status flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus(pub u8);

impl DeviceStatus {
    /// Device reset
    pub const RESET: u8 = 0;
    /// Driver has found the device
    pub const ACKNOWLEDGE: u8 = 1;
    /// Driver knows how to drive the device
    pub const DRIVER: u8 = 2;
    /// Driver is ready to drive the device
    pub const DRIVER_OK: u8 = 4;
    /// Feature negotiation is complete
    pub const FEATURES_OK: u8 = 8;
    /// Device has experienced an error
    pub const DEVICE_NEEDS_RESET: u8 = 64;
    /// Something went wrong on the driver side
    pub const FAILED: u8 = 128;

    /// Create reset status
    pub const fn reset() -> Self {
        Self(Self::RESET)
    }

    /// Check if acknowledged
    pub const fn is_acknowledged(&self) -> bool {
        (self.0 & Self::ACKNOWLEDGE) != 0
    }

    /// Check if features OK
    pub const fn is_features_ok(&self) -> bool {
        (self.0 & Self::FEATURES_OK) != 0
    }

    /// Check if driver OK
    pub const fn is_driver_ok(&self) -> bool {
        (self.0 & Self::DRIVER_OK) != 0
    }

    /// Check if device needs reset
    pub const fn needs_reset(&self) -> bool {
        (self.0 & Self::DEVICE_NEEDS_RESET) != 0
    }

    /// Check if failed
    pub const fn is_failed(&self) -> bool {
        (self.0 & Self::FAILED) != 0
    }

    /// Status with `bits` added
    pub const fn with(self, bits: u8) -> Self {
        Self(self.0 | bits)
    }
}

// =============================================================================
// ROLES
// =============================================================================

/// Which side of the virtio device this processor plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioRole {
    /// Virtio driver: the host, which owns buffer allocation
    Driver,
    /// Virtio device: the remote, which consumes buffers the host provides
    Device,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Virtio result type
pub type VirtioResult<T> = Result<T, VirtioError>;

/// VirtIO error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// Queue not available
    QueueNotAvailable,
    /// Queue full
    QueueFull,
    /// Invalid descriptor
    InvalidDescriptor,
    /// I/O error
    IoError,
    /// Timeout
    Timeout,
    /// Invalid parameter
    InvalidParameter,
    /// Out of memory
    OutOfMemory,
    /// Not supported
    NotSupported,
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioError::QueueNotAvailable => write!(f, "Queue not available"),
            VirtioError::QueueFull => write!(f, "Queue full"),
            VirtioError::InvalidDescriptor => write!(f, "Invalid descriptor"),
            VirtioError::IoError => write!(f, "I/O error"),
            VirtioError::Timeout => write!(f, "Timeout"),
            VirtioError::InvalidParameter => write!(f, "Invalid parameter"),
            VirtioError::OutOfMemory => write!(f, "Out of memory"),
            VirtioError::NotSupported => write!(f, "Not supported"),
        }
    }
}

impl From<HalError> for VirtioError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::InvalidParameter | HalError::InvalidAddress => VirtioError::InvalidParameter,
            HalError::OutOfMemory => VirtioError::OutOfMemory,
            HalError::Timeout => VirtioError::Timeout,
            HalError::NotSupported => VirtioError::NotSupported,
            _ => VirtioError::IoError,
        }
    }
}

// =============================================================================
// DEVICE CONTRACT
// =============================================================================

/// Location of one vring in shared memory
#[derive(Debug, Clone)]
pub struct VringInfo {
    /// Region holding the ring
    pub io: Arc<IoRegion>,
    /// Offset of the descriptor table inside `io`
    pub offset: usize,
    /// Number of descriptors (power of two)
    pub num: u16,
    /// Alignment of the used ring
    pub align: usize,
    /// Identifier passed to [`VirtioDevice::notify`]
    pub notify_id: u32,
}

/// A virtio device as seen by a transport
pub trait VirtioDevice: Send + Sync {
    /// Side played by this processor
    fn role(&self) -> VirtioRole;

    /// Virtio device type
    fn device_type(&self) -> VirtioDeviceType;

    /// Current device status
    fn status(&self) -> DeviceStatus;

    /// Write the device status
    fn set_status(&self, status: DeviceStatus);

    /// Features offered by the device
    fn device_features(&self) -> u64;

    /// Negotiated features
    fn features(&self) -> u64;

    /// Record negotiated features
    fn set_features(&self, features: u64);

    /// Read device config space
    fn read_config(&self, offset: usize, dst: &mut [u8]) -> VirtioResult<()>;

    /// Write device config space
    fn write_config(&self, offset: usize, src: &[u8]) -> VirtioResult<()>;

    /// Number of vrings the device has
    fn num_vrings(&self) -> usize;

    /// Location of vring `index`
    fn vring(&self, index: usize) -> VirtioResult<VringInfo>;

    /// Signal the other side that queue `notify_id` has work
    fn notify(&self, notify_id: u32);

    /// Reset the device
    fn reset(&self) {
        self.set_status(DeviceStatus::reset());
    }

    /// Accept the subset of device features the driver supports
    fn negotiate_features(&self, supported: u64) -> u64 {
        let negotiated = self.device_features() & supported;
        self.set_features(negotiated);
        negotiated
    }

    /// Create one virtqueue per name, in vring order
    fn create_virtqueues(&self, names: &[&'static str]) -> VirtioResult<Vec<Virtqueue>> {
        if names.len() > self.num_vrings() {
            log::error!(
                "virtio: {} queues requested, device has {}",
                names.len(),
                self.num_vrings()
            );
            return Err(VirtioError::QueueNotAvailable);
        }
        names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let info = self.vring(index)?;
                Virtqueue::new(*name, index as u16, info, self.role())
            })
            .collect()
    }
}
