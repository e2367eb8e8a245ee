//! # Shared Memory Segments
//!
//! A segment is a named region plus the set of references currently held on
//! it. Each `mmap` and each device `attach` creates one [`ShmRef`]; the
//! segment's refcount is the number of live references and gates `close`.
//!
//! Callers hold a [`RefHandle`] rather than a pointer into the reference
//! list. Handles are never reused, so a stale handle simply matches nothing.

use crate::device::Device;
use crate::name::truncate;
use crate::provider::{ShmAllocation, ShmProvider};
use crate::{ShmError, ShmResult, SHM_NAME_MAX};
use amp_hal::{DmaDirection, ScatterList};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use spin::Mutex;

bitflags! {
    /// Segment attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShmFlags: u32 {
        /// Backing memory is mapped cacheable
        const CACHED = 1 << 0;
        /// Backing memory is mapped non-cacheable
        const NON_CACHED = 1 << 1;
        /// Devices may read the segment
        const DEV_READ = 1 << 4;
        /// Devices may write the segment
        const DEV_WRITE = 1 << 5;
    }
}

/// Segment-specific hooks
///
/// Every method has a default matching the behaviour of a segment with no
/// hooks at all.
pub trait ShmOps: Send + Sync {
    /// Build the scatter-list for a new local mapping
    fn mmap(&self, shm: &SharedMemory, _size: usize) -> ShmResult<ScatterList> {
        Ok(shm.scatter_list().clone())
    }

    /// Tear down a mapping created by [`ShmOps::mmap`]
    fn munmap(&self, _shm: &SharedMemory, _sg: &ScatterList) {}

    /// Make CPU writes visible to `dev`
    fn sync_for_device(&self, _shm: &SharedMemory, _dev: &Device, _dir: DmaDirection) {}

    /// Make device writes visible to the CPU
    fn sync_for_cpu(&self, _shm: &SharedMemory, _dir: DmaDirection) {}
}

/// Sync hooks backed by the I/O regions' cache maintenance
///
/// Flushes/invalidates every entry of the segment's scatter-list.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheSyncOps;

impl ShmOps for CacheSyncOps {
    fn sync_for_device(&self, shm: &SharedMemory, _dev: &Device, dir: DmaDirection) {
        for entry in shm.scatter_list().entries() {
            entry.io.sync_for_device(entry.offset, entry.len, dir);
        }
    }

    fn sync_for_cpu(&self, shm: &SharedMemory, dir: DmaDirection) {
        for entry in shm.scatter_list().entries() {
            entry.io.sync_for_cpu(entry.offset, entry.len, dir);
        }
    }
}

/// Opaque handle to one reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefHandle(u64);

impl RefHandle {
    /// Raw value, for diagnostics
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Result of `mmap`/`attach`
#[derive(Debug, Clone)]
pub struct Mapping {
    /// Handle to pass back to `munmap`
    pub handle: RefHandle,
    /// Memory the consumer may use
    pub sg: ScatterList,
}

/// One live consumer of a segment
#[derive(Debug, Clone)]
pub struct ShmRef {
    /// Handle identifying this reference
    pub handle: RefHandle,
    /// Scatter-list handed to the consumer
    pub sg: ScatterList,
    /// Owning device, `None` for a CPU mapping
    pub device: Option<crate::DeviceId>,
    /// Reserved
    pub flags: u32,
}

#[derive(Debug, Default)]
struct RefTable {
    refcount: usize,
    refs: Vec<ShmRef>,
    next_handle: u64,
}

impl RefTable {
    fn position(&self, handle: RefHandle) -> Option<usize> {
        self.refs.iter().position(|r| r.handle == handle)
    }
}

/// A named shared memory segment
pub struct SharedMemory {
    /// Full name, `"<provider>/<subname>"`
    name: heapless::String<SHM_NAME_MAX>,
    /// Optional numeric id
    id: Option<u32>,
    /// Size in bytes; 0 matches any requested size
    size: usize,
    /// Attributes
    flags: ShmFlags,
    /// Default mapping
    sg: ScatterList,
    /// Allocating provider, `None` for statically registered segments
    provider: Option<Arc<dyn ShmProvider>>,
    /// Segment hooks
    ops: Option<Arc<dyn ShmOps>>,
    /// Refcount and reference list
    refs: Mutex<RefTable>,
}

impl SharedMemory {
    /// Describe a statically owned segment
    ///
    /// Names longer than [`SHM_NAME_MAX`] bytes are truncated.
    pub fn new(name: &str, size: usize, sg: ScatterList) -> Self {
        Self {
            name: truncate(name),
            id: None,
            size,
            flags: ShmFlags::empty(),
            sg,
            provider: None,
            ops: None,
            refs: Mutex::new(RefTable::default()),
        }
    }

    /// Set the numeric id
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the attributes
    pub fn with_flags(mut self, flags: ShmFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Install segment hooks
    pub fn with_ops(mut self, ops: Arc<dyn ShmOps>) -> Self {
        self.ops = Some(ops);
        self
    }

    pub(crate) fn from_allocation(
        name: &str,
        flags: ShmFlags,
        allocation: ShmAllocation,
        provider: Arc<dyn ShmProvider>,
    ) -> Self {
        let mut shm = Self::new(name, allocation.size, allocation.sg).with_flags(flags);
        shm.id = allocation.id;
        shm.ops = allocation.ops;
        shm.provider = Some(provider);
        shm
    }

    /// Full name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric id
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Attributes
    pub fn flags(&self) -> ShmFlags {
        self.flags
    }

    /// Default mapping
    pub fn scatter_list(&self) -> &ScatterList {
        &self.sg
    }

    /// Allocating provider
    pub fn provider(&self) -> Option<&Arc<dyn ShmProvider>> {
        self.provider.as_ref()
    }

    /// Number of live references
    pub fn refcount(&self) -> usize {
        self.refs.lock().refcount
    }

    /// Snapshot of the reference list, in creation order
    pub fn references(&self) -> Vec<ShmRef> {
        self.refs.lock().refs.clone()
    }

    /// Map the segment for local access
    ///
    /// If the mmap hook fails nothing is recorded and the error is returned.
    pub fn mmap(&self, size: usize) -> ShmResult<Mapping> {
        let sg = match &self.ops {
            Some(ops) => ops.mmap(self, size).map_err(|err| {
                log::error!("shm {}: mmap hook failed: {}", self.name(), err);
                err
            })?,
            None => self.sg.clone(),
        };
        Ok(self.link(sg, None))
    }

    /// Drop a local mapping
    ///
    /// Unknown handles are ignored.
    pub fn munmap(&self, handle: RefHandle) {
        let sg = {
            let table = self.refs.lock();
            match table.position(handle) {
                Some(pos) => table.refs[pos].sg.clone(),
                None => {
                    log::debug!("shm {}: munmap of unknown handle {}", self.name(), handle.0);
                    return;
                }
            }
        };
        if let Some(ops) = &self.ops {
            ops.munmap(self, &sg);
        }
        self.unlink(handle);
    }

    /// Attach the segment to a device
    pub fn attach(&self, dev: &Device, dir: DmaDirection) -> ShmResult<Mapping> {
        let sg = match dev.bus() {
            Some(bus) => bus.dev_shm_attach(dev, self, dir).map_err(|err| {
                log::error!(
                    "shm {}: attach to {} on bus {} failed: {}",
                    self.name(),
                    dev.name(),
                    bus.name(),
                    err
                );
                err
            })?,
            None => self.sg.clone(),
        };
        Ok(self.link(sg, Some(dev.id())))
    }

    /// Detach the segment from a device
    ///
    /// Only the oldest attachment of `dev` is removed; attach and detach
    /// must be paired. A device with no attachment is ignored.
    pub fn detach(&self, dev: &Device) {
        let found = {
            let table = self.refs.lock();
            table
                .refs
                .iter()
                .find(|r| r.device == Some(dev.id()))
                .map(|r| (r.handle, r.sg.clone()))
        };
        let Some((handle, sg)) = found else {
            log::debug!("shm {}: {} is not attached", self.name(), dev.name());
            return;
        };
        if let Some(bus) = dev.bus() {
            bus.dev_shm_detach(dev, self, &sg);
        }
        self.unlink(handle);
    }

    /// Hand the segment over to `dev`
    pub fn sync_for_device(&self, dev: &Device, dir: DmaDirection) {
        if let Some(ops) = &self.ops {
            ops.sync_for_device(self, dev, dir);
        }
    }

    /// Take the segment back from the device side
    pub fn sync_for_cpu(&self, dir: DmaDirection) {
        if let Some(ops) = &self.ops {
            ops.sync_for_cpu(self, dir);
        }
    }

    /// Busy check used by the registry while it holds its own lock
    pub(crate) fn with_refs_idle<R>(&self, f: impl FnOnce() -> R) -> ShmResult<R> {
        let table = self.refs.lock();
        if table.refcount != 0 {
            return Err(ShmError::InUse);
        }
        let result = f();
        drop(table);
        Ok(result)
    }

    fn link(&self, sg: ScatterList, device: Option<crate::DeviceId>) -> Mapping {
        let mut table = self.refs.lock();
        let handle = RefHandle(table.next_handle);
        table.next_handle += 1;
        table.refs.push(ShmRef {
            handle,
            sg: sg.clone(),
            device,
            flags: 0,
        });
        table.refcount += 1;
        log::debug!(
            "shm {}: reference {} added (refcount {})",
            self.name(),
            handle.0,
            table.refcount
        );
        Mapping { handle, sg }
    }

    fn unlink(&self, handle: RefHandle) {
        let mut table = self.refs.lock();
        if let Some(pos) = table.position(handle) {
            table.refs.remove(pos);
            table.refcount -= 1;
            log::debug!(
                "shm {}: reference {} removed (refcount {})",
                self.name(),
                handle.0,
                table.refcount
            );
        }
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name.as_str())
            .field("id", &self.id)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("provider", &self.provider.as_ref().map(|p| p.name()))
            .field("refcount", &self.refcount())
            .finish()
    }
}
