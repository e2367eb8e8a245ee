//! # Remoteproc Virtio Device
//!
//! A virtio device whose status, features, vrings and config space are
//! described by a vdev entry of a remoteproc resource table. The table sits
//! in memory both processors can reach; the host plays the virtio driver and
//! the remote firmware plays the device.
//!
//! ```text
//! offset  field
//! 0       type (RSC_VDEV)
//! 4       id (virtio device type)
//! 8       notifyid
//! 12      dfeatures
//! 16      gfeatures
//! 20      config_len
//! 24      status          (u8)
//! 25      num_of_vrings   (u8)
//! 28      vring[n]        { da, align, num, notifyid, pa }  20 bytes each
//! 28+20n  config[config_len]
//! ```

use crate::{
    DeviceStatus, VirtioDevice, VirtioDeviceType, VirtioError, VirtioResult, VirtioRole,
    VringInfo,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use amp_hal::{IoRegion, PhysAddr};
use core::fmt;

/// Resource type of a vdev entry
pub const RSC_VDEV: u32 = 3;

mod field {
    pub const TYPE: usize = 0;
    pub const ID: usize = 4;
    pub const NOTIFYID: usize = 8;
    pub const DFEATURES: usize = 12;
    pub const GFEATURES: usize = 16;
    pub const CONFIG_LEN: usize = 20;
    pub const STATUS: usize = 24;
    pub const NUM_VRINGS: usize = 25;
    pub const VRINGS: usize = 28;

    pub const VRING_SIZE: usize = 20;
    pub const VRING_DA: usize = 0;
    pub const VRING_ALIGN: usize = 4;
    pub const VRING_NUM: usize = 8;
    pub const VRING_NOTIFYID: usize = 12;
    pub const VRING_PA: usize = 16;
}

/// Kick delivery to the other processor (mailbox, IPI, ...)
pub trait Notifier: Send + Sync {
    /// Raise the notification for `notify_id`
    fn notify(&self, notify_id: u32);
}

impl<F> Notifier for F
where
    F: Fn(u32) + Send + Sync,
{
    fn notify(&self, notify_id: u32) {
        self(notify_id)
    }
}

/// One vring of a vdev resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VringResource {
    /// Device address of the ring
    pub da: u32,
    /// Used ring alignment
    pub align: u32,
    /// Number of descriptors
    pub num: u32,
    /// Notification id
    pub notify_id: u32,
}

/// Contents of a vdev resource entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdevResource {
    /// Virtio device type
    pub id: VirtioDeviceType,
    /// Notification id of the device itself
    pub notify_id: u32,
    /// Features offered by the device
    pub dfeatures: u32,
    /// Bytes of config space
    pub config_len: u32,
    /// Vrings
    pub vrings: Vec<VringResource>,
}

impl VdevResource {
    /// Bytes occupied in the resource table
    pub fn size(&self) -> usize {
        field::VRINGS + self.vrings.len() * field::VRING_SIZE + self.config_len as usize
    }

    /// Lay the entry out at `offset` in `io`, status reset and config zeroed
    pub fn write_to(&self, io: &IoRegion, offset: usize) -> VirtioResult<()> {
        if self.vrings.len() > u8::MAX as usize {
            return Err(VirtioError::InvalidParameter);
        }
        io.check(offset, self.size())?;
        io.block_set(offset, 0, self.size())?;
        io.write32(offset + field::TYPE, RSC_VDEV)?;
        io.write32(offset + field::ID, self.id as u32)?;
        io.write32(offset + field::NOTIFYID, self.notify_id)?;
        io.write32(offset + field::DFEATURES, self.dfeatures)?;
        io.write32(offset + field::CONFIG_LEN, self.config_len)?;
        io.write8(offset + field::NUM_VRINGS, self.vrings.len() as u8)?;
        for (i, vring) in self.vrings.iter().enumerate() {
            let base = offset + field::VRINGS + i * field::VRING_SIZE;
            io.write32(base + field::VRING_DA, vring.da)?;
            io.write32(base + field::VRING_ALIGN, vring.align)?;
            io.write32(base + field::VRING_NUM, vring.num)?;
            io.write32(base + field::VRING_NOTIFYID, vring.notify_id)?;
            io.write32(base + field::VRING_PA, 0)?;
        }
        io.flush(offset, self.size());
        Ok(())
    }
}

/// Virtio device backed by a remoteproc vdev resource
pub struct RprocVirtioDevice {
    /// Side played by this processor
    role: VirtioRole,
    /// Device type from the resource
    device_type: VirtioDeviceType,
    /// Region holding the resource table
    rsc: Arc<IoRegion>,
    /// Offset of the vdev entry
    offset: usize,
    /// Config space length
    config_len: usize,
    /// Resolved vrings
    vrings: Vec<VringInfo>,
    /// Kick delivery
    notifier: Arc<dyn Notifier>,
}

impl RprocVirtioDevice {
    /// Parse the vdev entry at `offset` in `rsc`
    ///
    /// Vring device addresses are resolved inside `vring_io`.
    pub fn new(
        role: VirtioRole,
        rsc: Arc<IoRegion>,
        offset: usize,
        vring_io: Arc<IoRegion>,
        notifier: Arc<dyn Notifier>,
    ) -> VirtioResult<Self> {
        rsc.invalidate(offset, field::VRINGS);
        if rsc.read32(offset + field::TYPE)? != RSC_VDEV {
            log::error!("rproc vdev: no vdev resource at {:#x}", offset);
            return Err(VirtioError::InvalidParameter);
        }
        let id = rsc.read32(offset + field::ID)?;
        let device_type = VirtioDeviceType::from_u32(id).ok_or_else(|| {
            log::error!("rproc vdev: unknown device id {}", id);
            VirtioError::NotSupported
        })?;
        let config_len = rsc.read32(offset + field::CONFIG_LEN)? as usize;
        let num_vrings = rsc.read8(offset + field::NUM_VRINGS)? as usize;
        rsc.check(offset, field::VRINGS + num_vrings * field::VRING_SIZE + config_len)?;
        rsc.invalidate(offset + field::VRINGS, num_vrings * field::VRING_SIZE);

        let mut vrings = Vec::with_capacity(num_vrings);
        for i in 0..num_vrings {
            let base = offset + field::VRINGS + i * field::VRING_SIZE;
            let da = rsc.read32(base + field::VRING_DA)?;
            let align = rsc.read32(base + field::VRING_ALIGN)? as usize;
            let num = rsc.read32(base + field::VRING_NUM)?;
            let notify_id = rsc.read32(base + field::VRING_NOTIFYID)?;

            let ring_offset = vring_io.phys_to_offset(PhysAddr::new(da as u64)).ok_or_else(|| {
                log::error!("rproc vdev: vring {} at {:#x} outside shared memory", i, da);
                VirtioError::InvalidParameter
            })?;
            let num = u16::try_from(num).map_err(|_| VirtioError::InvalidParameter)?;
            vrings.push(VringInfo { io: vring_io.clone(), offset: ring_offset, num, align, notify_id });
        }

        log::info!("rproc vdev: {} with {} vrings ({:?})", device_type, num_vrings, role);
        Ok(Self { role, device_type, rsc, offset, config_len, vrings, notifier })
    }

    fn config_offset(&self) -> usize {
        self.offset + field::VRINGS + self.vrings.len() * field::VRING_SIZE
    }

    fn check_config(&self, offset: usize, len: usize) -> VirtioResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.config_len => Ok(()),
            _ => Err(VirtioError::InvalidParameter),
        }
    }

    fn read_field(&self, field: usize) -> u32 {
        self.rsc.invalidate(self.offset + field, 4);
        self.rsc.read32(self.offset + field).unwrap_or(0)
    }

    fn write_field(&self, field: usize, value: u32) {
        if self.rsc.write32(self.offset + field, value).is_ok() {
            self.rsc.flush(self.offset + field, 4);
        }
    }
}

impl VirtioDevice for RprocVirtioDevice {
    fn role(&self) -> VirtioRole {
        self.role
    }

    fn device_type(&self) -> VirtioDeviceType {
        self.device_type
    }

    fn status(&self) -> DeviceStatus {
        self.rsc.invalidate(self.offset + field::STATUS, 1);
        DeviceStatus(self.rsc.read8(self.offset + field::STATUS).unwrap_or(DeviceStatus::FAILED))
    }

    fn set_status(&self, status: DeviceStatus) {
        if self.rsc.write8(self.offset + field::STATUS, status.0).is_ok() {
            self.rsc.flush(self.offset + field::STATUS, 1);
        }
    }

    fn device_features(&self) -> u64 {
        self.read_field(field::DFEATURES) as u64
    }

    fn features(&self) -> u64 {
        self.read_field(field::GFEATURES) as u64
    }

    fn set_features(&self, features: u64) {
        // The resource only carries the low 32 feature bits
        let target = match self.role {
            VirtioRole::Driver => field::GFEATURES,
            VirtioRole::Device => field::DFEATURES,
        };
        self.write_field(target, features as u32);
    }

    fn read_config(&self, offset: usize, dst: &mut [u8]) -> VirtioResult<()> {
        self.check_config(offset, dst.len())?;
        let at = self.config_offset() + offset;
        self.rsc.invalidate(at, dst.len());
        self.rsc.block_read(at, dst)?;
        Ok(())
    }

    fn write_config(&self, offset: usize, src: &[u8]) -> VirtioResult<()> {
        self.check_config(offset, src.len())?;
        let at = self.config_offset() + offset;
        self.rsc.block_write(at, src)?;
        self.rsc.flush(at, src.len());
        Ok(())
    }

    fn num_vrings(&self) -> usize {
        self.vrings.len()
    }

    fn vring(&self, index: usize) -> VirtioResult<VringInfo> {
        self.vrings.get(index).cloned().ok_or(VirtioError::QueueNotAvailable)
    }

    fn notify(&self, notify_id: u32) {
        self.notifier.notify(notify_id);
    }
}

impl fmt::Debug for RprocVirtioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RprocVirtioDevice")
            .field("role", &self.role)
            .field("device_type", &self.device_type)
            .field("offset", &self.offset)
            .field("config_len", &self.config_len)
            .field("vrings", &self.vrings)
            .finish()
    }
}
