//! # Devices and Buses
//!
//! A device is something a segment can be attached to: a remote core, a DMA
//! master, an accelerator behind an IOMMU. Its bus decides what attaching
//! means; without a bus, attaching hands out the segment's default mapping.

use crate::{SharedMemory, ShmResult};
use amp_hal::{DmaDirection, ScatterList};
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Allocate a fresh identifier
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Create from raw value
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus-specific shared memory hooks
///
/// Both hooks run without any segment lock held and may block.
pub trait Bus: Send + Sync {
    /// Bus name
    fn name(&self) -> &str;

    /// Map `shm` for `dev` and return the scatter-list the device must use
    ///
    /// The default hands out the segment's own scatter-list.
    fn dev_shm_attach(
        &self,
        _dev: &Device,
        shm: &SharedMemory,
        _dir: DmaDirection,
    ) -> ShmResult<ScatterList> {
        Ok(shm.scatter_list().clone())
    }

    /// Undo [`Bus::dev_shm_attach`]
    fn dev_shm_detach(&self, _dev: &Device, _shm: &SharedMemory, _sg: &ScatterList) {}
}

/// A device segments can be attached to
pub struct Device {
    /// Device name
    name: String,
    /// Identity used to match attachments
    id: DeviceId,
    /// Owning bus
    bus: Option<Arc<dyn Bus>>,
}

impl Device {
    /// Create a device without a bus
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            id: DeviceId::new(),
            bus: None,
        }
    }

    /// Place the device on a bus
    pub fn with_bus(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device identity
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Owning bus
    pub fn bus(&self) -> Option<&Arc<dyn Bus>> {
        self.bus.as_ref()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("bus", &self.bus.as_ref().map(|b| b.name()))
            .finish()
    }
}
