//! # RPMsg Virtio Device
//!
//! Binds RPMsg endpoints to a pair of virtqueues. The host (virtio driver)
//! carves message buffers from shared pools; the remote (virtio device) only
//! ever uses buffers the host made available.
//!
//! ## Transmit buffers
//!
//! A sender takes, in order:
//! 1. a buffer from the reclaimer list (released unsent, or returned by the
//!    other side and collected by the tx callback)
//! 2. a buffer the tx queue reports back (host: used ring, remote: avail ring)
//! 3. host only: a fresh buffer from the pool
//!
//! When none is left the send fails with [`RpmsgError::NoBuffer`]; it is not
//! retried.
//!
//! ## Locking
//!
//! One lock covers queues, pools, the reclaimer list and the endpoint table.
//! It is never held while an endpoint callback runs or while the other side
//! is notified.

use crate::endpoint::{
    endpoint_name, AddressBitmap, Endpoint, EndpointCallback, EndpointInfo, NsBindCallback,
    RxMessage,
};
use crate::header::{NsFlags, NsMessage, RpmsgHeader};
use crate::pool::ShmPool;
use crate::{
    RpmsgError, RpmsgResult, RPMSG_ADDR_ANY, RPMSG_BUFFER_SIZE, RPMSG_NOTIFY_ALL,
    RPMSG_NS_EPT_ADDR, VIRTIO_RPMSG_F_NS,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use amp_hal::IoRegion;
use amp_virtio::{
    AvailBuffer, DeviceStatus, VirtioDevice, VirtioError, VirtioRole, Virtqueue, VqSegment,
};
use core::fmt;
use spin::Mutex;

const HDR: usize = RpmsgHeader::SIZE;

cfg_if::cfg_if! {
    if #[cfg(feature = "dcache")] {
        fn flush(io: &IoRegion, offset: usize, len: usize) {
            io.flush(offset, len);
        }

        fn invalidate(io: &IoRegion, offset: usize, len: usize) {
            io.invalidate(offset, len);
        }
    } else {
        #[inline(always)]
        fn flush(_io: &IoRegion, _offset: usize, _len: usize) {}

        #[inline(always)]
        fn invalidate(_io: &IoRegion, _offset: usize, _len: usize) {}
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// How long the remote waits for the host during bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyWait {
    /// Poll the status until the host sets `DRIVER_OK`
    #[default]
    Forever,
    /// Give up with [`RpmsgError::Init`] after this many status reads
    Polls(u32),
}

/// Device configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpmsgVirtioConfig {
    /// Size of host-to-remote buffers, header included
    pub h2r_buf_size: u32,
    /// Size of remote-to-host buffers, header included
    pub r2h_buf_size: u32,
    /// Host: rx buffers come from the first pool, tx buffers from the second
    pub split_shpool: bool,
    /// Remote: bring-up wait policy
    pub ready_wait: ReadyWait,
}

impl RpmsgVirtioConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            h2r_buf_size: RPMSG_BUFFER_SIZE,
            r2h_buf_size: RPMSG_BUFFER_SIZE,
            split_shpool: false,
            ready_wait: ReadyWait::Forever,
        }
    }

    /// Set buffer sizes
    pub const fn with_buf_sizes(mut self, h2r: u32, r2h: u32) -> Self {
        self.h2r_buf_size = h2r;
        self.r2h_buf_size = r2h;
        self
    }

    /// Use separate rx and tx pools
    pub const fn with_split_shpool(mut self, split: bool) -> Self {
        self.split_shpool = split;
        self
    }

    /// Set the remote bring-up wait policy
    pub const fn with_ready_wait(mut self, wait: ReadyWait) -> Self {
        self.ready_wait = wait;
        self
    }
}

impl Default for RpmsgVirtioConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// BUFFERS
// =============================================================================

/// One message buffer in the shared region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferSlot {
    /// Offset in the shared buffer region
    pub(crate) offset: usize,
    /// Capacity, header included
    pub(crate) len: u32,
    /// Remote only: descriptor the buffer came with
    pub(crate) head: Option<u16>,
}

/// A received buffer kept past its callback
#[derive(Debug)]
pub struct HeldBuffer {
    slot: BufferSlot,
    src: u32,
    dst: u32,
    len: usize,
}

impl HeldBuffer {
    pub(crate) fn new(slot: BufferSlot, src: u32, dst: u32, len: usize) -> Self {
        Self { slot, src, dst, len }
    }

    /// Sender address
    pub fn src(&self) -> u32 {
        self.src
    }

    /// Destination address
    pub fn dst(&self) -> u32 {
        self.dst
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Empty payload
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A transmit buffer taken for in-place filling
///
/// Send it with [`RpmsgVirtioDevice::send_nocopy`] or give it back with
/// [`RpmsgVirtioDevice::release_tx_buffer`].
pub struct TxPayload {
    io: Arc<IoRegion>,
    slot: BufferSlot,
}

impl TxPayload {
    /// Payload bytes available
    pub fn capacity(&self) -> usize {
        (self.slot.len as usize).saturating_sub(HDR)
    }

    /// Copy `data` into the payload at `offset`
    pub fn write(&mut self, offset: usize, data: &[u8]) -> RpmsgResult<usize> {
        match offset.checked_add(data.len()) {
            Some(end) if end <= self.capacity() => {}
            _ => return Err(RpmsgError::BufferSize),
        }
        Ok(self.io.block_write(self.slot.offset + HDR + offset, data)?)
    }
}

impl fmt::Debug for TxPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxPayload")
            .field("offset", &self.slot.offset)
            .field("capacity", &self.capacity())
            .finish()
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// Lock-protected device state; `None` once de-initialised
struct State {
    rvq: Virtqueue,
    svq: Virtqueue,
    pools: Vec<ShmPool>,
    reclaimer: Vec<BufferSlot>,
    endpoints: Vec<Endpoint>,
    bitmap: AddressBitmap,
}

/// Name service endpoint
struct NameService;

impl EndpointCallback for NameService {
    fn on_message(&self, dev: &RpmsgVirtioDevice, msg: &RxMessage<'_>) -> RpmsgResult<()> {
        dev.handle_ns(msg)
    }
}

/// RPMsg over a virtio device
pub struct RpmsgVirtioDevice {
    vdev: Arc<dyn VirtioDevice>,
    role: VirtioRole,
    shm_io: Arc<IoRegion>,
    config: RpmsgVirtioConfig,
    support_ns: bool,
    rx_notify_id: u32,
    tx_notify_id: u32,
    ns_bind: Option<Arc<dyn NsBindCallback>>,
    state: Mutex<Option<State>>,
}

impl RpmsgVirtioDevice {
    /// Bring the device up
    ///
    /// `shm_io` is the shared buffer region; host pools must live in it.
    /// The host needs one pool (two with `split_shpool`) and returns without
    /// waiting for the remote. The remote passes no pool and waits for the
    /// host per `config.ready_wait`.
    pub fn init(
        vdev: Arc<dyn VirtioDevice>,
        shm_io: Arc<IoRegion>,
        mut pools: Vec<ShmPool>,
        config: RpmsgVirtioConfig,
        ns_bind: Option<Arc<dyn NsBindCallback>>,
    ) -> RpmsgResult<Self> {
        let role = vdev.role();
        if config.h2r_buf_size as usize <= HDR || config.r2h_buf_size as usize <= HDR {
            log::error!(
                "rpmsg: buffer sizes {}/{} leave no room for a payload",
                config.h2r_buf_size,
                config.r2h_buf_size
            );
            return Err(RpmsgError::Param);
        }
        let features = match role {
            VirtioRole::Driver => {
                let needed = if config.split_shpool { 2 } else { 1 };
                if pools.len() < needed || pools.iter().any(|pool| !Arc::ptr_eq(pool.io(), &shm_io)) {
                    log::error!("rpmsg: bad host configuration");
                    return Err(RpmsgError::Param);
                }
                vdev.set_status(DeviceStatus::reset());
                vdev.set_status(DeviceStatus::reset().with(DeviceStatus::ACKNOWLEDGE));
                vdev.set_status(vdev.status().with(DeviceStatus::DRIVER));
                let features = vdev.negotiate_features(1 << VIRTIO_RPMSG_F_NS);
                vdev.set_status(vdev.status().with(DeviceStatus::FEATURES_OK));
                features
            }
            VirtioRole::Device => {
                wait_driver_ok(vdev.as_ref(), config.ready_wait)?;
                vdev.features()
            }
        };
        let support_ns = features & (1 << VIRTIO_RPMSG_F_NS) != 0;

        let names: [&'static str; 2] = match role {
            VirtioRole::Driver => ["rx_vq", "tx_vq"],
            VirtioRole::Device => ["tx_vq", "rx_vq"],
        };
        let mut vqs = vdev.create_virtqueues(&names).map_err(|err| {
            log::error!("rpmsg: virtqueue creation failed: {}", err);
            RpmsgError::Init
        })?;
        let (vq1, vq0) = match (vqs.pop(), vqs.pop()) {
            (Some(vq1), Some(vq0)) => (vq1, vq0),
            _ => return Err(RpmsgError::Init),
        };
        let (mut rvq, svq) = match role {
            VirtioRole::Driver => (vq0, vq1),
            VirtioRole::Device => (vq1, vq0),
        };

        if role == VirtioRole::Driver {
            let size = config.r2h_buf_size as usize;
            let pool = &mut pools[0];
            for _ in 0..rvq.num() {
                let buf = pool.get_buffer(size).ok_or_else(|| {
                    log::error!("rpmsg: pool too small for {} rx buffers", rvq.num());
                    RpmsgError::NoBuffer
                })?;
                shm_io.block_set(buf.offset, 0, buf.len)?;
                flush(&shm_io, buf.offset, buf.len);
                let addr = shm_io.phys(buf.offset).ok_or(RpmsgError::Param)?;
                rvq.add_buffer(&[VqSegment { addr, len: size as u32, writable: true }], buf.offset)?;
            }
        }

        let mut endpoints = Vec::new();
        if support_ns {
            endpoints.push(Endpoint {
                name: endpoint_name("NS"),
                addr: RPMSG_NS_EPT_ADDR,
                dest_addr: RPMSG_NS_EPT_ADDR,
                callback: Arc::new(NameService),
            });
        }

        let rx_notify_id = rvq.notify_id();
        let tx_notify_id = svq.notify_id();
        let state = State {
            rvq,
            svq,
            pools,
            reclaimer: Vec::new(),
            endpoints,
            bitmap: AddressBitmap::new(),
        };

        if role == VirtioRole::Driver {
            vdev.set_status(vdev.status().with(DeviceStatus::DRIVER_OK));
        }
        log::info!(
            "rpmsg: {:?} up, name service {}",
            role,
            if support_ns { "on" } else { "off" }
        );

        Ok(Self {
            vdev,
            role,
            shm_io,
            config,
            support_ns,
            rx_notify_id,
            tx_notify_id,
            ns_bind,
            state: Mutex::new(Some(state)),
        })
    }

    /// Side played by this processor
    pub fn role(&self) -> VirtioRole {
        self.role
    }

    /// Whether the name service was negotiated
    pub fn supports_ns(&self) -> bool {
        self.support_ns
    }

    /// Underlying virtio device
    pub fn vdev(&self) -> &Arc<dyn VirtioDevice> {
        &self.vdev
    }

    /// Payload capacity of a transmit buffer
    ///
    /// The remote sends in host buffers, so its capacity is read from the
    /// next buffer the host made available; [`RpmsgError::NoBuffer`] when
    /// there is none.
    pub fn tx_buffer_size(&self) -> RpmsgResult<usize> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(RpmsgError::DevState)?;
        let size = match self.role {
            VirtioRole::Driver => self.config.h2r_buf_size,
            VirtioRole::Device => state.svq.next_available_length().ok_or(RpmsgError::NoBuffer)?,
        };
        payload_capacity(size)
    }

    /// Payload capacity of a receive buffer
    pub fn rx_buffer_size(&self) -> RpmsgResult<usize> {
        self.ensure_up()?;
        let size = match self.role {
            VirtioRole::Driver => self.config.r2h_buf_size,
            VirtioRole::Device => self.config.h2r_buf_size,
        };
        payload_capacity(size)
    }

    /// Bytes left in the host pools
    pub fn pool_available(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map_or(0, |state| state.pools.iter().map(ShmPool::available).sum())
    }

    fn ensure_up(&self) -> RpmsgResult<()> {
        if self.state.lock().is_none() {
            return Err(RpmsgError::DevState);
        }
        Ok(())
    }

    /// Remote only: refuse to transmit before the host is ready
    fn check_peer(&self) -> RpmsgResult<()> {
        if self.role == VirtioRole::Device && !self.vdev.status().is_driver_ok() {
            return Err(RpmsgError::DevState);
        }
        Ok(())
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Create endpoint `name` at `src` (or any free address) talking to `dest`
    ///
    /// An unbound endpoint is announced through the name service when the
    /// other side supports it.
    pub fn create_endpoint(
        &self,
        name: &str,
        src: u32,
        dest: u32,
        callback: Arc<dyn EndpointCallback>,
    ) -> RpmsgResult<u32> {
        let addr = {
            let mut guard = self.state.lock();
            let state = guard.as_mut().ok_or(RpmsgError::DevState)?;
            let addr = if src == RPMSG_ADDR_ANY {
                state.bitmap.alloc()?
            } else if AddressBitmap::covers(src) {
                state.bitmap.reserve(src)?;
                src
            } else if state.endpoints.iter().any(|ept| ept.addr == src) {
                return Err(RpmsgError::Address);
            } else {
                src
            };
            state.endpoints.push(Endpoint {
                name: endpoint_name(name),
                addr,
                dest_addr: dest,
                callback,
            });
            addr
        };
        log::info!("rpmsg: endpoint {} at {:#x}", name, addr);

        if self.support_ns && dest == RPMSG_ADDR_ANY && !name.is_empty() {
            if let Err(err) = self.send_ns(name, addr, NsFlags::Create) {
                log::error!("rpmsg: announcing {} failed: {}", name, err);
                self.remove_endpoint(addr);
                return Err(err);
            }
        }
        Ok(addr)
    }

    /// Destroy the endpoint at `addr`
    pub fn destroy_endpoint(&self, addr: u32) -> RpmsgResult<()> {
        if addr == RPMSG_NS_EPT_ADDR && self.support_ns {
            return Err(RpmsgError::Param);
        }
        self.ensure_up()?;
        let ept = self.remove_endpoint(addr).ok_or(RpmsgError::Address)?;
        if self.support_ns && !ept.name.is_empty() {
            if let Err(err) = self.send_ns(&ept.name, addr, NsFlags::Destroy) {
                log::warn!("rpmsg: destroy announcement for {} failed: {}", ept.name, err);
            }
        }
        log::info!("rpmsg: endpoint {} at {:#x} destroyed", ept.name, addr);
        ept.callback.on_unbind(self, addr);
        Ok(())
    }

    fn remove_endpoint(&self, addr: u32) -> Option<Endpoint> {
        let mut guard = self.state.lock();
        let state = guard.as_mut()?;
        let pos = state.endpoints.iter().position(|ept| ept.addr == addr)?;
        state.bitmap.release(addr);
        Some(state.endpoints.remove(pos))
    }

    /// Snapshot of the endpoint at `addr`
    pub fn endpoint(&self, addr: u32) -> Option<EndpointInfo> {
        let guard = self.state.lock();
        guard.as_ref()?.endpoints.iter().find(|ept| ept.addr == addr).map(Endpoint::info)
    }

    /// Snapshot of every endpoint
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let guard = self.state.lock();
        guard
            .as_ref()
            .map(|state| state.endpoints.iter().map(Endpoint::info).collect())
            .unwrap_or_default()
    }

    /// Whether the endpoint at `addr` knows its remote address
    pub fn is_ready(&self, addr: u32) -> bool {
        self.endpoint(addr).is_some_and(|info| info.dest_addr != RPMSG_ADDR_ANY)
    }

    fn send_ns(&self, name: &str, addr: u32, flags: NsFlags) -> RpmsgResult<usize> {
        let msg = NsMessage::new(name, addr, flags);
        log::debug!("rpmsg: ns {:?} {} at {:#x}", flags, name, addr);
        self.send_offchannel(addr, RPMSG_NS_EPT_ADDR, &msg.to_bytes())
    }

    fn handle_ns(&self, msg: &RxMessage<'_>) -> RpmsgResult<()> {
        let ns = NsMessage::from_bytes(msg.payload)?;
        let name = ns.name();
        match ns.flags {
            NsFlags::Create => {
                let bound = {
                    let mut guard = self.state.lock();
                    let state = guard.as_mut().ok_or(RpmsgError::DevState)?;
                    match state
                        .endpoints
                        .iter_mut()
                        .find(|ept| ept.name.as_str() == name && !ept.is_bound())
                    {
                        Some(ept) => {
                            ept.dest_addr = ns.addr;
                            true
                        }
                        None => false,
                    }
                };
                if bound {
                    log::debug!("rpmsg: {} bound to {:#x}", name, ns.addr);
                } else if let Some(ns_bind) = &self.ns_bind {
                    ns_bind.on_bind(self, name, ns.addr);
                } else {
                    log::debug!("rpmsg: unclaimed announcement {} at {:#x}", name, ns.addr);
                }
            }
            NsFlags::Destroy => {
                let unbound = {
                    let mut guard = self.state.lock();
                    let state = guard.as_mut().ok_or(RpmsgError::DevState)?;
                    state
                        .endpoints
                        .iter_mut()
                        .find(|ept| ept.name.as_str() == name && ept.dest_addr == ns.addr)
                        .map(|ept| {
                            ept.dest_addr = RPMSG_ADDR_ANY;
                            (ept.callback.clone(), ept.addr)
                        })
                };
                if let Some((callback, addr)) = unbound {
                    log::debug!("rpmsg: {} unbound", name);
                    callback.on_unbind(self, addr);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Transmit
    // =========================================================================

    /// Send `data` from endpoint `addr` to its bound destination
    pub fn send(&self, addr: u32, data: &[u8]) -> RpmsgResult<usize> {
        let ept = self.endpoint(addr).ok_or(RpmsgError::Address)?;
        if ept.dest_addr == RPMSG_ADDR_ANY {
            return Err(RpmsgError::Address);
        }
        self.send_offchannel(addr, ept.dest_addr, data)
    }

    /// Send `data` from endpoint `addr` to `dst`
    pub fn send_to(&self, addr: u32, dst: u32, data: &[u8]) -> RpmsgResult<usize> {
        if self.endpoint(addr).is_none() {
            return Err(RpmsgError::Address);
        }
        self.send_offchannel(addr, dst, data)
    }

    /// Send `data` with explicit source and destination addresses
    pub fn send_offchannel(&self, src: u32, dst: u32, data: &[u8]) -> RpmsgResult<usize> {
        if src == RPMSG_ADDR_ANY || dst == RPMSG_ADDR_ANY {
            return Err(RpmsgError::Address);
        }
        if data.len() > u16::MAX as usize {
            return Err(RpmsgError::BufferSize);
        }
        self.check_peer()?;

        let kick = {
            let mut guard = self.state.lock();
            let state = guard.as_mut().ok_or(RpmsgError::DevState)?;
            let slot = self.take_tx_buffer(state)?;
            if HDR + data.len() > slot.len as usize {
                state.reclaimer.push(slot);
                return Err(RpmsgError::BufferSize);
            }
            if let Err(err) = self.shm_io.block_write(slot.offset + HDR, data) {
                state.reclaimer.push(slot);
                return Err(err.into());
            }
            self.publish(state, slot, src, dst, data.len())?;
            state.svq.needs_kick()
        };
        if kick {
            self.vdev.notify(self.tx_notify_id);
        }
        Ok(data.len())
    }

    /// Take a transmit buffer to fill in place
    pub fn get_tx_payload_buffer(&self) -> RpmsgResult<TxPayload> {
        self.check_peer()?;
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(RpmsgError::DevState)?;
        let slot = self.take_tx_buffer(state)?;
        Ok(TxPayload { io: self.shm_io.clone(), slot })
    }

    /// Send the first `len` bytes of `payload` from `src` to `dst`
    ///
    /// On failure the buffer goes back to the reclaimer list.
    pub fn send_nocopy(
        &self,
        src: u32,
        dst: u32,
        payload: TxPayload,
        len: usize,
    ) -> RpmsgResult<usize> {
        let kick = {
            let mut guard = self.state.lock();
            let state = guard.as_mut().ok_or(RpmsgError::DevState)?;
            if len > payload.capacity() || len > u16::MAX as usize {
                state.reclaimer.push(payload.slot);
                return Err(RpmsgError::BufferSize);
            }
            if src == RPMSG_ADDR_ANY || dst == RPMSG_ADDR_ANY {
                state.reclaimer.push(payload.slot);
                return Err(RpmsgError::Address);
            }
            self.publish(state, payload.slot, src, dst, len)?;
            state.svq.needs_kick()
        };
        if kick {
            self.vdev.notify(self.tx_notify_id);
        }
        Ok(len)
    }

    /// Give back a transmit buffer without sending it
    pub fn release_tx_buffer(&self, payload: TxPayload) -> RpmsgResult<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(RpmsgError::DevState)?;
        state.reclaimer.push(payload.slot);
        Ok(())
    }

    fn take_tx_buffer(&self, state: &mut State) -> RpmsgResult<BufferSlot> {
        if let Some(slot) = state.reclaimer.pop() {
            return Ok(slot);
        }
        let slot = match self.role {
            VirtioRole::Driver => {
                let size = self.config.h2r_buf_size;
                if let Some(used) = state.svq.get_buffer() {
                    Some(BufferSlot { offset: used.cookie, len: size, head: None })
                } else if state.svq.is_full() {
                    None
                } else {
                    let index = usize::from(self.config.split_shpool);
                    state
                        .pools
                        .get_mut(index)
                        .and_then(|pool| pool.get_buffer(size as usize))
                        .map(|buf| BufferSlot { offset: buf.offset, len: size, head: None })
                }
            }
            VirtioRole::Device => state
                .svq
                .get_available_buffer()
                .and_then(|avail| self.host_buffer(&mut state.svq, &avail)),
        };
        slot.ok_or_else(|| {
            log::warn!("rpmsg: no tx buffer available");
            RpmsgError::NoBuffer
        })
    }

    /// Write the header and hand the buffer to the other side
    fn publish(
        &self,
        state: &mut State,
        slot: BufferSlot,
        src: u32,
        dst: u32,
        len: usize,
    ) -> RpmsgResult<()> {
        let header = RpmsgHeader::new(src, dst, len as u16);
        let total = HDR + len;
        let result = self
            .shm_io
            .block_write(slot.offset, &header.to_bytes())
            .map_err(RpmsgError::from)
            .and_then(|_| {
                flush(&self.shm_io, slot.offset, total);
                match (self.role, slot.head) {
                    (VirtioRole::Driver, _) => {
                        let addr = self.shm_io.phys(slot.offset).ok_or(RpmsgError::Param)?;
                        let seg = VqSegment { addr, len: total as u32, writable: false };
                        state.svq.add_buffer(&[seg], slot.offset)?;
                        Ok(())
                    }
                    (VirtioRole::Device, Some(head)) => {
                        Ok(state.svq.add_consumed_buffer(head, total as u32)?)
                    }
                    (VirtioRole::Device, None) => Err(RpmsgError::Param),
                }
            });
        if result.is_err() {
            state.reclaimer.push(slot);
        }
        result
    }

    // =========================================================================
    // Receive
    // =========================================================================

    /// Service a notification from the other side
    ///
    /// `notify_id` selects the queue; [`RPMSG_NOTIFY_ALL`] services both.
    pub fn notify_received(&self, notify_id: u32) -> RpmsgResult<()> {
        self.ensure_up()?;
        if notify_id == RPMSG_NOTIFY_ALL || notify_id == self.rx_notify_id {
            self.rx_callback();
        }
        if notify_id == RPMSG_NOTIFY_ALL || notify_id == self.tx_notify_id {
            self.tx_callback();
        }
        Ok(())
    }

    fn rx_callback(&self) {
        let mut returned = false;
        while let Some((slot, header, callback)) = self.next_rx(&mut returned) {
            // SAFETY: the buffer belongs to this side until it is returned to
            // the rx queue below or through `release_rx_buffer`.
            let payload = match unsafe { self.shm_io.slice(slot.offset + HDR, header.len as usize) } {
                Ok(payload) => payload,
                Err(err) => {
                    log::warn!("rpmsg: dropping message at {:#x}: {}", slot.offset, err);
                    let mut guard = self.state.lock();
                    if let Some(state) = guard.as_mut() {
                        self.return_rx_buffer(state, slot);
                        returned = true;
                    }
                    continue;
                }
            };
            let msg = RxMessage::new(header.src, header.dst, payload, slot);
            if let Err(err) = callback.on_message(self, &msg) {
                log::warn!("rpmsg: endpoint {:#x} callback failed: {}", header.dst, err);
            }
            if !msg.is_held() {
                let mut guard = self.state.lock();
                if let Some(state) = guard.as_mut() {
                    self.return_rx_buffer(state, slot);
                    returned = true;
                }
            }
        }
        if returned {
            self.kick_rx();
        }
    }

    /// Next deliverable message; undeliverable ones are returned on the way
    fn next_rx(
        &self,
        returned: &mut bool,
    ) -> Option<(BufferSlot, RpmsgHeader, Arc<dyn EndpointCallback>)> {
        let mut guard = self.state.lock();
        let state = guard.as_mut()?;
        loop {
            let slot = self.take_rx_buffer(state)?;
            let header = match self.read_header(slot) {
                Ok(header) => header,
                Err(err) => {
                    log::warn!("rpmsg: dropping malformed message: {}", err);
                    self.return_rx_buffer(state, slot);
                    *returned = true;
                    continue;
                }
            };
            match state.endpoints.iter_mut().find(|ept| ept.addr == header.dst) {
                Some(ept) => {
                    if !ept.is_bound() {
                        ept.dest_addr = header.src;
                    }
                    return Some((slot, header, ept.callback.clone()));
                }
                None => {
                    log::warn!("rpmsg: no endpoint at {:#x}", header.dst);
                    self.return_rx_buffer(state, slot);
                    *returned = true;
                }
            }
        }
    }

    fn take_rx_buffer(&self, state: &mut State) -> Option<BufferSlot> {
        match self.role {
            VirtioRole::Driver => state.rvq.get_buffer().map(|used| BufferSlot {
                offset: used.cookie,
                len: self.config.r2h_buf_size,
                head: None,
            }),
            VirtioRole::Device => {
                let avail = state.rvq.get_available_buffer()?;
                self.host_buffer(&mut state.rvq, &avail)
            }
        }
    }

    /// Remote: locate a host buffer in the shared region
    ///
    /// A buffer not entirely inside the region goes straight back to the
    /// host, unused.
    fn host_buffer(&self, vq: &mut Virtqueue, avail: &AvailBuffer) -> Option<BufferSlot> {
        let offset = self
            .shm_io
            .phys_to_offset(avail.addr)
            .filter(|&offset| self.shm_io.check(offset, avail.len as usize).is_ok());
        match offset {
            Some(offset) => Some(BufferSlot { offset, len: avail.len, head: Some(avail.head) }),
            None => {
                log::error!(
                    "rpmsg: {} buffer {} ({} bytes) outside shared memory",
                    vq.name(),
                    avail.addr,
                    avail.len
                );
                if vq.add_consumed_buffer(avail.head, 0).is_err() {
                    log::error!("rpmsg: dropping descriptor {}", avail.head);
                }
                None
            }
        }
    }

    fn read_header(&self, slot: BufferSlot) -> RpmsgResult<RpmsgHeader> {
        if (slot.len as usize) < HDR {
            return Err(RpmsgError::BufferSize);
        }
        invalidate(&self.shm_io, slot.offset, HDR);
        let mut raw = [0u8; HDR];
        if self.shm_io.block_read(slot.offset, &mut raw)? != HDR {
            return Err(RpmsgError::BufferSize);
        }
        let header = RpmsgHeader::from_bytes(&raw);
        if HDR + header.len as usize > slot.len as usize {
            return Err(RpmsgError::BufferSize);
        }
        invalidate(&self.shm_io, slot.offset + HDR, header.len as usize);
        Ok(header)
    }

    fn return_rx_buffer(&self, state: &mut State, slot: BufferSlot) {
        let result = match (self.role, slot.head) {
            (VirtioRole::Driver, _) => match self.shm_io.phys(slot.offset) {
                Some(addr) => state
                    .rvq
                    .add_buffer(&[VqSegment { addr, len: slot.len, writable: true }], slot.offset)
                    .map(|_| ()),
                None => Err(VirtioError::InvalidParameter),
            },
            (VirtioRole::Device, Some(head)) => state.rvq.add_consumed_buffer(head, slot.len),
            (VirtioRole::Device, None) => Err(VirtioError::InvalidDescriptor),
        };
        if let Err(err) = result {
            log::error!("rpmsg: losing rx buffer at {:#x}: {}", slot.offset, err);
        }
    }

    fn kick_rx(&self) {
        let kick = self.state.lock().as_ref().is_some_and(|state| state.rvq.needs_kick());
        if kick {
            self.vdev.notify(self.rx_notify_id);
        }
    }

    /// Return a buffer kept with [`RxMessage::hold`]
    pub fn release_rx_buffer(&self, held: HeldBuffer) -> RpmsgResult<()> {
        {
            let mut guard = self.state.lock();
            let state = guard.as_mut().ok_or(RpmsgError::DevState)?;
            self.return_rx_buffer(state, held.slot);
        }
        self.kick_rx();
        Ok(())
    }

    /// Payload of a held buffer
    pub fn held_payload<'a>(&'a self, held: &'a HeldBuffer) -> RpmsgResult<&'a [u8]> {
        self.ensure_up()?;
        // SAFETY: a held buffer stays with this side until released, which
        // consumes `held` and so ends this borrow.
        Ok(unsafe { self.shm_io.slice(held.slot.offset + HDR, held.len)? })
    }

    fn tx_callback(&self) {
        if self.role != VirtioRole::Driver {
            return;
        }
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return;
        };
        let mut count = 0;
        while let Some(used) = state.svq.get_buffer() {
            state.reclaimer.push(BufferSlot {
                offset: used.cookie,
                len: self.config.h2r_buf_size,
                head: None,
            });
            count += 1;
        }
        if count > 0 {
            log::debug!("rpmsg: reclaimed {} tx buffers", count);
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Tear the device down
    ///
    /// Every endpoint is dropped with its unbind hook called; the virtqueues
    /// and the reclaimer list go away. The shared buffer memory is left to
    /// its owner.
    pub fn deinit(&self) -> RpmsgResult<()> {
        let state = self.state.lock().take().ok_or(RpmsgError::DevState)?;
        for ept in &state.endpoints {
            if ept.addr != RPMSG_NS_EPT_ADDR || !self.support_ns {
                ept.callback.on_unbind(self, ept.addr);
            }
        }
        log::info!("rpmsg: {:?} down, {} endpoints dropped", self.role, state.endpoints.len());
        Ok(())
    }
}

fn payload_capacity(size: u32) -> RpmsgResult<usize> {
    (size as usize).checked_sub(HDR).ok_or(RpmsgError::BufferSize)
}

fn wait_driver_ok(vdev: &dyn VirtioDevice, wait: ReadyWait) -> RpmsgResult<()> {
    let mut remaining = match wait {
        ReadyWait::Forever => None,
        ReadyWait::Polls(polls) => Some(polls),
    };
    loop {
        if remaining == Some(0) {
            log::warn!("rpmsg: host never set DRIVER_OK");
            return Err(RpmsgError::Init);
        }
        if vdev.status().is_driver_ok() {
            return Ok(());
        }
        remaining = remaining.map(|polls| polls - 1);
        core::hint::spin_loop();
    }
}

impl fmt::Debug for RpmsgVirtioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpmsgVirtioDevice")
            .field("role", &self.role)
            .field("config", &self.config)
            .field("support_ns", &self.support_ns)
            .field("up", &self.state.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{region, SHM_PHYS};
    use crate::RPMSG_RESERVED_ADDRESSES;
    use alloc::vec;
    use amp_virtio::{RprocVirtioDevice, VdevResource, VirtioDeviceType, VringResource};
    use core::sync::atomic::{AtomicUsize, Ordering};

    type Kicks = Arc<Mutex<Vec<u32>>>;
    type Inbox = Arc<Mutex<Vec<Vec<u8>>>>;

    const NS: u32 = 1 << VIRTIO_RPMSG_F_NS;
    const POOL_BASE: usize = 0x800;

    /// Resource table, shared memory and one doorbell per direction
    struct Board {
        rsc: Arc<IoRegion>,
        shm: Arc<IoRegion>,
        to_host: Kicks,
        to_remote: Kicks,
    }

    impl Board {
        fn new(dfeatures: u32) -> Self {
            Self::with_shm(dfeatures, region(0x4000))
        }

        fn with_shm(dfeatures: u32, shm: Arc<IoRegion>) -> Self {
            let rsc = region(0x100);
            VdevResource {
                id: VirtioDeviceType::Rpmsg,
                notify_id: 0,
                dfeatures,
                config_len: 0,
                vrings: vec![
                    VringResource { da: SHM_PHYS as u32, align: 16, num: 4, notify_id: 0 },
                    VringResource { da: SHM_PHYS as u32 + 0x400, align: 16, num: 4, notify_id: 1 },
                ],
            }
            .write_to(&rsc, 0)
            .unwrap();
            Self { rsc, shm, to_host: Kicks::default(), to_remote: Kicks::default() }
        }

        fn vdev(&self, role: VirtioRole) -> Arc<dyn VirtioDevice> {
            let sink = match role {
                VirtioRole::Driver => self.to_remote.clone(),
                VirtioRole::Device => self.to_host.clone(),
            };
            let notifier = Arc::new(move |id: u32| sink.lock().push(id));
            Arc::new(
                RprocVirtioDevice::new(role, self.rsc.clone(), 0, self.shm.clone(), notifier)
                    .unwrap(),
            )
        }

        fn pool(&self, base: usize, size: usize) -> ShmPool {
            ShmPool::new(self.shm.clone(), base, size).unwrap()
        }

        fn host_with(
            &self,
            pools: Vec<ShmPool>,
            config: RpmsgVirtioConfig,
            ns_bind: Option<Arc<dyn NsBindCallback>>,
        ) -> RpmsgResult<RpmsgVirtioDevice> {
            RpmsgVirtioDevice::init(self.vdev(VirtioRole::Driver), self.shm.clone(), pools, config, ns_bind)
        }

        fn host(&self) -> RpmsgVirtioDevice {
            self.host_with(vec![self.pool(POOL_BASE, 0x3800)], RpmsgVirtioConfig::new(), None)
                .unwrap()
        }

        fn remote(&self) -> RpmsgResult<RpmsgVirtioDevice> {
            let config = RpmsgVirtioConfig::new().with_ready_wait(ReadyWait::Polls(3));
            RpmsgVirtioDevice::init(self.vdev(VirtioRole::Device), self.shm.clone(), Vec::new(), config, None)
        }

        /// Deliver doorbells until both sides are idle
        fn pump(&self, host: &RpmsgVirtioDevice, remote: &RpmsgVirtioDevice) {
            for _ in 0..64 {
                let for_remote = core::mem::take(&mut *self.to_remote.lock());
                let for_host = core::mem::take(&mut *self.to_host.lock());
                if for_remote.is_empty() && for_host.is_empty() {
                    return;
                }
                for id in for_remote {
                    remote.notify_received(id).unwrap();
                }
                for id in for_host {
                    host.notify_received(id).unwrap();
                }
            }
            panic!("doorbells never settled");
        }
    }

    fn recorder(inbox: &Inbox) -> Arc<dyn EndpointCallback> {
        let inbox = inbox.clone();
        Arc::new(move |_dev: &RpmsgVirtioDevice, msg: &RxMessage<'_>| -> RpmsgResult<()> {
            inbox.lock().push(msg.payload.to_vec());
            Ok(())
        })
    }

    fn echo() -> Arc<dyn EndpointCallback> {
        Arc::new(|dev: &RpmsgVirtioDevice, msg: &RxMessage<'_>| -> RpmsgResult<()> {
            dev.send_to(msg.dst, msg.src, msg.payload).map(|_| ())
        })
    }

    #[derive(Default)]
    struct CountUnbinds(AtomicUsize);

    impl EndpointCallback for CountUnbinds {
        fn on_message(&self, _dev: &RpmsgVirtioDevice, _msg: &RxMessage<'_>) -> RpmsgResult<()> {
            Ok(())
        }

        fn on_unbind(&self, _dev: &RpmsgVirtioDevice, _addr: u32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_host_init_fills_rx_queue() {
        let board = Board::new(NS);
        let host = board.host();
        assert_eq!(host.pool_available(), 0x3800 - 4 * 512);
        assert!(host.supports_ns());
        assert!(host.vdev().status().is_driver_ok());
        assert_eq!(host.endpoint(RPMSG_NS_EPT_ADDR).unwrap().name.as_str(), "NS");
        assert_eq!(host.tx_buffer_size().unwrap(), 512 - 16);
        assert_eq!(host.rx_buffer_size().unwrap(), 512 - 16);
    }

    #[test]
    fn test_undersized_buffers_rejected() {
        let board = Board::new(0);
        // Refused before the remote starts waiting for the host
        let tiny = RpmsgVirtioConfig::new().with_buf_sizes(8, 8).with_ready_wait(ReadyWait::Polls(3));
        let remote =
            RpmsgVirtioDevice::init(board.vdev(VirtioRole::Device), board.shm.clone(), Vec::new(), tiny, None);
        assert_eq!(remote.unwrap_err(), RpmsgError::Param);

        let header_only = RpmsgVirtioConfig::new().with_buf_sizes(512, 16);
        let host = board.host_with(vec![board.pool(POOL_BASE, 0x3800)], header_only, None);
        assert_eq!(host.unwrap_err(), RpmsgError::Param);
    }

    #[test]
    fn test_remote_tx_size_follows_host_buffers() {
        let board = Board::new(0);
        let config = RpmsgVirtioConfig::new().with_buf_sizes(256, 256);
        let host = board.host_with(vec![board.pool(POOL_BASE, 0x3800)], config, None).unwrap();
        let remote = board.remote().unwrap();

        assert_eq!(host.tx_buffer_size().unwrap(), 256 - 16);
        assert_eq!(remote.tx_buffer_size().unwrap(), 256 - 16);
        assert_eq!(remote.rx_buffer_size().unwrap(), 512 - 16);
        assert_eq!(remote.send_offchannel(0x20, 0x10, &[0u8; 241]), Err(RpmsgError::BufferSize));
        assert_eq!(remote.send_offchannel(0x20, 0x10, &[0u8; 240]), Ok(240));
    }

    #[test]
    fn test_remote_tx_size_without_host_buffers() {
        let board = Board::new(0);
        let _host = board.host();
        let remote = board.remote().unwrap();
        for _ in 0..4 {
            remote.send_offchannel(0x20, 0x10, b"x").unwrap();
        }
        assert_eq!(remote.tx_buffer_size(), Err(RpmsgError::NoBuffer));
    }

    #[test]
    fn test_remote_rejects_buffers_past_region_end() {
        let board = Board::new(0);
        let vdev = board.vdev(VirtioRole::Driver);
        let mut vqs = vdev.create_virtqueues(&["rx_vq", "tx_vq"]).unwrap();
        let addr = board.shm.phys(0x3f00).unwrap();
        let straddling = [VqSegment { addr, len: 512, writable: true }];
        vqs[0].add_buffer(&straddling, 0x3f00).unwrap();
        vqs[1].add_buffer(&straddling, 0x3f00).unwrap();
        vdev.set_status(DeviceStatus::reset().with(DeviceStatus::DRIVER_OK));

        let remote = board.remote().unwrap();
        let inbox = Inbox::default();
        remote.create_endpoint("sink", 0, RPMSG_ADDR_ANY, recorder(&inbox)).unwrap();

        assert_eq!(remote.send_offchannel(0x20, 0x10, b"x"), Err(RpmsgError::NoBuffer));
        remote.notify_received(RPMSG_NOTIFY_ALL).unwrap();
        assert!(inbox.lock().is_empty());

        // Both go back to the host untouched
        for vq in &mut vqs {
            let used = vq.get_buffer().unwrap();
            assert_eq!((used.cookie, used.len), (0x3f00, 0));
        }
    }

    #[test]
    fn test_host_pool_too_small() {
        let board = Board::new(0);
        let pool = board.pool(POOL_BASE, 4 * 512 - 1);
        let err = board.host_with(vec![pool], RpmsgVirtioConfig::new(), None).unwrap_err();
        assert_eq!(err, RpmsgError::NoBuffer);
    }

    #[test]
    fn test_host_bad_pools() {
        let board = Board::new(0);
        assert_eq!(
            board.host_with(Vec::new(), RpmsgVirtioConfig::new(), None).unwrap_err(),
            RpmsgError::Param
        );
        let split = RpmsgVirtioConfig::new().with_split_shpool(true);
        assert_eq!(
            board.host_with(vec![board.pool(POOL_BASE, 0x1000)], split, None).unwrap_err(),
            RpmsgError::Param
        );
        let foreign = ShmPool::new(region(0x4000), 0, 0x4000).unwrap();
        assert_eq!(
            board.host_with(vec![foreign], RpmsgVirtioConfig::new(), None).unwrap_err(),
            RpmsgError::Param
        );
    }

    #[test]
    fn test_pool_exhaustion_fails_send() {
        // 4 KiB pool, four 1 KiB rx buffers: nothing left for transmit
        let board = Board::new(0);
        let config = RpmsgVirtioConfig::new().with_buf_sizes(512, 1024);
        let host = board.host_with(vec![board.pool(POOL_BASE, 4096)], config, None).unwrap();
        assert_eq!(host.pool_available(), 0);
        assert_eq!(host.send_offchannel(0x400, 0x401, b"x"), Err(RpmsgError::NoBuffer));
        assert_eq!(host.get_tx_payload_buffer().unwrap_err(), RpmsgError::NoBuffer);
    }

    #[test]
    fn test_split_pools() {
        let board = Board::new(0);
        let config = RpmsgVirtioConfig::new().with_split_shpool(true);
        let pools = vec![board.pool(POOL_BASE, 4 * 512), board.pool(0x1000, 0x1000)];
        let host = board.host_with(pools, config, None).unwrap();
        assert_eq!(host.pool_available(), 0x1000);
        host.send_offchannel(0x400, 0x401, b"x").unwrap();
        assert_eq!(host.pool_available(), 0x1000 - 512);
    }

    #[test]
    fn test_remote_waits_for_host() {
        let board = Board::new(NS);
        assert_eq!(board.remote().unwrap_err(), RpmsgError::Init);

        let _host = board.host();
        let remote = board.remote().unwrap();
        assert!(remote.supports_ns());
        assert_eq!(remote.role(), VirtioRole::Device);
    }

    #[test]
    fn test_round_trip_with_name_service() {
        let board = Board::new(NS);
        let inbox = Inbox::default();
        let host_inbox = inbox.clone();
        let ns_bind: Arc<dyn NsBindCallback> =
            Arc::new(move |dev: &RpmsgVirtioDevice, name: &str, dest: u32| {
                dev.create_endpoint(name, RPMSG_ADDR_ANY, dest, recorder(&host_inbox)).unwrap();
            });
        let host = board
            .host_with(vec![board.pool(POOL_BASE, 0x3800)], RpmsgVirtioConfig::new(), Some(ns_bind))
            .unwrap();
        let remote = board.remote().unwrap();

        let echo_addr = remote.create_endpoint("echo", RPMSG_ADDR_ANY, RPMSG_ADDR_ANY, echo()).unwrap();
        assert_eq!(echo_addr, RPMSG_RESERVED_ADDRESSES);
        assert!(!remote.is_ready(echo_addr));
        board.pump(&host, &remote);

        let host_ept = host.endpoints().into_iter().find(|ept| ept.name.as_str() == "echo").unwrap();
        assert_eq!(host_ept.dest_addr, echo_addr);

        host.send(host_ept.addr, b"hello").unwrap();
        board.pump(&host, &remote);
        assert_eq!(*inbox.lock(), vec![b"hello".to_vec()]);
        assert_eq!(remote.endpoint(echo_addr).unwrap().dest_addr, host_ept.addr);

        remote.destroy_endpoint(echo_addr).unwrap();
        board.pump(&host, &remote);
        assert!(!host.is_ready(host_ept.addr));
        assert!(remote.endpoint(echo_addr).is_none());
    }

    #[test]
    fn test_tx_buffers_are_reclaimed() {
        let board = Board::new(0);
        let host = board.host();
        let remote = board.remote().unwrap();
        let inbox = Inbox::default();
        host.create_endpoint("ping", 0x10, 0x20, recorder(&inbox)).unwrap();
        remote.create_endpoint("pong", 0x20, 0x10, echo()).unwrap();

        host.send(0x10, b"ping").unwrap();
        board.pump(&host, &remote);
        let steady = host.pool_available();
        assert_eq!(steady, 0x3800 - 5 * 512);

        for _ in 0..10 {
            host.send(0x10, b"ping").unwrap();
            board.pump(&host, &remote);
        }
        assert_eq!(host.pool_available(), steady);
        assert_eq!(inbox.lock().len(), 11);
    }

    #[test]
    fn test_held_rx_buffer() {
        let board = Board::new(0);
        let host = board.host();
        let remote = board.remote().unwrap();
        let kept: Arc<Mutex<Option<HeldBuffer>>> = Arc::default();
        let slot = kept.clone();
        let keeper = Arc::new(move |_dev: &RpmsgVirtioDevice, msg: &RxMessage<'_>| -> RpmsgResult<()> {
            *slot.lock() = msg.hold();
            assert!(msg.hold().is_none());
            Ok(())
        });
        host.create_endpoint("src", 0x10, 0x20, recorder(&Inbox::default())).unwrap();
        remote.create_endpoint("sink", 0x20, 0x10, keeper).unwrap();

        host.send(0x10, b"keep me").unwrap();
        board.pump(&host, &remote);
        let held = kept.lock().take().unwrap();
        assert_eq!(held.src(), 0x10);
        assert_eq!(held.len(), 7);
        assert_eq!(remote.held_payload(&held).unwrap(), &b"keep me"[..]);

        // Not returned yet: the next send needs a fresh buffer
        let before = host.pool_available();
        remote.release_rx_buffer(held).unwrap();
        board.pump(&host, &remote);
        host.send(0x10, b"again").unwrap();
        assert_eq!(host.pool_available(), before);
    }

    #[test]
    fn test_nocopy_send_and_release() {
        let board = Board::new(0);
        let host = board.host();
        let remote = board.remote().unwrap();
        let inbox = Inbox::default();
        remote.create_endpoint("sink", 0x20, 0x10, recorder(&inbox)).unwrap();

        let payload = host.get_tx_payload_buffer().unwrap();
        assert_eq!(payload.capacity(), 512 - 16);
        let after_take = host.pool_available();
        host.release_tx_buffer(payload).unwrap();

        let mut payload = host.get_tx_payload_buffer().unwrap();
        assert_eq!(host.pool_available(), after_take);
        payload.write(0, b"zero").unwrap();
        payload.write(4, b"-copy").unwrap();
        assert_eq!(payload.write(494, b"abc"), Err(RpmsgError::BufferSize));
        host.send_nocopy(0x10, 0x20, payload, 9).unwrap();
        board.pump(&host, &remote);
        assert_eq!(*inbox.lock(), vec![b"zero-copy".to_vec()]);
    }

    #[test]
    fn test_send_errors() {
        let board = Board::new(0);
        let host = board.host();
        let addr = host
            .create_endpoint("lonely", RPMSG_ADDR_ANY, RPMSG_ADDR_ANY, recorder(&Inbox::default()))
            .unwrap();
        assert_eq!(host.send(addr, b"x"), Err(RpmsgError::Address));
        assert_eq!(host.send(0x999, b"x"), Err(RpmsgError::Address));
        assert_eq!(host.send_offchannel(addr, RPMSG_ADDR_ANY, b"x"), Err(RpmsgError::Address));

        let before = host.pool_available();
        assert_eq!(host.send_offchannel(addr, 0x20, &[0u8; 497]), Err(RpmsgError::BufferSize));
        // The buffer went to the reclaimer, not back to the pool
        assert_eq!(host.pool_available(), before - 512);
        host.send_offchannel(addr, 0x20, &[0u8; 496]).unwrap();
        assert_eq!(host.pool_available(), before - 512);
    }

    #[test]
    fn test_endpoint_addresses() {
        let board = Board::new(0);
        let host = board.host();
        let counter = Arc::new(CountUnbinds::default());

        assert_eq!(host.create_endpoint("a", 0x20, RPMSG_ADDR_ANY, counter.clone()), Ok(0x20));
        assert_eq!(
            host.create_endpoint("b", 0x20, RPMSG_ADDR_ANY, counter.clone()),
            Err(RpmsgError::Address)
        );
        assert_eq!(host.create_endpoint("c", 1030, RPMSG_ADDR_ANY, counter.clone()), Ok(1030));
        assert_eq!(
            host.create_endpoint("d", 1030, RPMSG_ADDR_ANY, counter.clone()),
            Err(RpmsgError::Address)
        );
        assert_eq!(host.create_endpoint("e", RPMSG_ADDR_ANY, RPMSG_ADDR_ANY, counter.clone()), Ok(1024));

        host.destroy_endpoint(1030).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(host.create_endpoint("c", 1030, RPMSG_ADDR_ANY, counter.clone()), Ok(1030));
        assert_eq!(host.destroy_endpoint(0x999), Err(RpmsgError::Address));
        assert_eq!(host.endpoints().len(), 3);
    }

    #[cfg(feature = "dcache")]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum CacheOp {
        Flush,
        Invalidate,
    }

    #[cfg(feature = "dcache")]
    #[derive(Default)]
    struct CacheLog(Mutex<Vec<(CacheOp, usize, usize)>>);

    #[cfg(feature = "dcache")]
    impl amp_hal::CacheOps for CacheLog {
        fn flush(&self, virt: amp_hal::VirtAddr, len: usize) {
            self.0.lock().push((CacheOp::Flush, virt.as_usize(), len));
        }

        fn invalidate(&self, virt: amp_hal::VirtAddr, len: usize) {
            self.0.lock().push((CacheOp::Invalidate, virt.as_usize(), len));
        }
    }

    #[cfg(feature = "dcache")]
    #[test]
    fn test_dcache_brackets_message_buffers() {
        let cache = Arc::new(CacheLog::default());
        let board = Board::with_shm(0, crate::testing::cached_region(0x4000, cache.clone()));
        let host = board.host();
        let remote = board.remote().unwrap();
        let inbox = Inbox::default();
        remote.create_endpoint("sink", 0x20, 0x10, recorder(&inbox)).unwrap();
        cache.0.lock().clear();

        host.send_offchannel(0x10, 0x20, b"cached").unwrap();
        // First transmit buffer follows the four rx buffers
        let buf = board.shm.virt(POOL_BASE + 4 * 512).unwrap().as_usize();
        assert!(cache.0.lock().contains(&(CacheOp::Flush, buf, 16 + 6)));

        board.pump(&host, &remote);
        assert_eq!(*inbox.lock(), vec![b"cached".to_vec()]);
        let log = cache.0.lock();
        assert!(log.contains(&(CacheOp::Invalidate, buf, 16)));
        assert!(log.contains(&(CacheOp::Invalidate, buf + 16, 6)));
        // Ring updates are bracketed too
        assert!(log.iter().filter(|(op, ..)| *op == CacheOp::Flush).count() > 1);
    }

    #[test]
    fn test_deinit() {
        let board = Board::new(NS);
        let host = board.host();
        let counter = Arc::new(CountUnbinds::default());
        host.create_endpoint("a", 0x20, 0x30, counter.clone()).unwrap();
        host.create_endpoint("b", 0x21, 0x31, counter.clone()).unwrap();

        host.deinit().unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(host.deinit(), Err(RpmsgError::DevState));
        assert_eq!(host.notify_received(0), Err(RpmsgError::DevState));
        assert_eq!(host.send_offchannel(0x20, 0x30, b"x"), Err(RpmsgError::DevState));
        assert_eq!(host.tx_buffer_size(), Err(RpmsgError::DevState));
        assert_eq!(
            host.create_endpoint("c", RPMSG_ADDR_ANY, 0x30, counter.clone()),
            Err(RpmsgError::DevState)
        );
        assert!(host.endpoints().is_empty());
        assert_eq!(host.pool_available(), 0);
    }
}
