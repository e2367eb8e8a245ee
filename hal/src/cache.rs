//! # Cache Maintenance
//!
//! Data cache operations bounding the window in which a device (or a remote
//! core) owns a buffer. On coherent interconnects these are no-ops.

use crate::VirtAddr;

/// Direction of a transfer, seen from the local CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// CPU writes, device reads
    ToDevice,
    /// Device writes, CPU reads
    FromDevice,
    /// Both sides read and write
    Bidirectional,
}

impl DmaDirection {
    /// Does the device read data the CPU produced?
    pub const fn to_device(self) -> bool {
        matches!(self, DmaDirection::ToDevice | DmaDirection::Bidirectional)
    }

    /// Does the CPU read data the device produced?
    pub const fn from_device(self) -> bool {
        matches!(self, DmaDirection::FromDevice | DmaDirection::Bidirectional)
    }
}

/// Data cache maintenance
///
/// Implementations wrap the architecture's clean/invalidate-by-address
/// instructions (e.g. `DC CVAC`/`DC IVAC` on AArch64).
pub trait CacheOps: Send + Sync {
    /// Write dirty lines covering `[virt, virt + len)` back to memory
    fn flush(&self, virt: VirtAddr, len: usize);

    /// Discard lines covering `[virt, virt + len)` so the next read hits memory
    fn invalidate(&self, virt: VirtAddr, len: usize);

    /// Make CPU writes visible to the device before handing the buffer over
    fn sync_for_device(&self, virt: VirtAddr, len: usize, dir: DmaDirection) {
        if dir.to_device() {
            self.flush(virt, len);
        }
    }

    /// Make device writes visible to the CPU before reading the buffer
    fn sync_for_cpu(&self, virt: VirtAddr, len: usize, dir: DmaDirection) {
        if dir.from_device() {
            self.invalidate(virt, len);
        }
    }
}

/// Cache operations for coherent memory (nothing to do)
#[derive(Debug, Clone, Copy, Default)]
pub struct Coherent;

impl CacheOps for Coherent {
    fn flush(&self, _virt: VirtAddr, _len: usize) {}

    fn invalidate(&self, _virt: VirtAddr, _len: usize) {}
}
