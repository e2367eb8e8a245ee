//! # Endpoints
//!
//! An endpoint is a local address plus a receive callback. Incoming messages
//! are routed by destination address; the first message from the other side
//! binds an unbound endpoint to its sender.

use crate::device::{BufferSlot, HeldBuffer, RpmsgVirtioDevice};
use crate::{
    RpmsgError, RpmsgResult, RPMSG_ADDR_ANY, RPMSG_ADDR_BMP_SIZE, RPMSG_NAME_SIZE,
    RPMSG_RESERVED_ADDRESSES,
};
use alloc::sync::Arc;
use core::cell::Cell;
use core::fmt;

/// Endpoint name
pub type EndpointName = heapless::String<RPMSG_NAME_SIZE>;

/// Receive side of an endpoint
pub trait EndpointCallback: Send + Sync {
    /// A message arrived for this endpoint
    ///
    /// Runs without any device lock held, so it may send replies.
    fn on_message(&self, dev: &RpmsgVirtioDevice, msg: &RxMessage<'_>) -> RpmsgResult<()>;

    /// The remote side of this endpoint went away
    fn on_unbind(&self, _dev: &RpmsgVirtioDevice, _addr: u32) {}
}

impl<F> EndpointCallback for F
where
    F: Fn(&RpmsgVirtioDevice, &RxMessage<'_>) -> RpmsgResult<()> + Send + Sync,
{
    fn on_message(&self, dev: &RpmsgVirtioDevice, msg: &RxMessage<'_>) -> RpmsgResult<()> {
        self(dev, msg)
    }
}

/// Hook for name service announcements of unknown endpoints
pub trait NsBindCallback: Send + Sync {
    /// The other side created endpoint `name` at `dest`
    fn on_bind(&self, dev: &RpmsgVirtioDevice, name: &str, dest: u32);
}

impl<F> NsBindCallback for F
where
    F: Fn(&RpmsgVirtioDevice, &str, u32) + Send + Sync,
{
    fn on_bind(&self, dev: &RpmsgVirtioDevice, name: &str, dest: u32) {
        self(dev, name, dest)
    }
}

/// A received message, valid for the duration of the callback
pub struct RxMessage<'a> {
    /// Sender address
    pub src: u32,
    /// Destination (local endpoint) address
    pub dst: u32,
    /// Payload, in place in the shared buffer
    pub payload: &'a [u8],
    /// Underlying buffer
    slot: BufferSlot,
    /// Set once the callback kept the buffer
    held: Cell<bool>,
}

impl<'a> RxMessage<'a> {
    pub(crate) fn new(src: u32, dst: u32, payload: &'a [u8], slot: BufferSlot) -> Self {
        Self { src, dst, payload, slot, held: Cell::new(false) }
    }

    /// Keep the buffer past the callback
    ///
    /// The buffer stays out of the receive queue until passed to
    /// [`RpmsgVirtioDevice::release_rx_buffer`]. Only the first call
    /// returns a handle.
    pub fn hold(&self) -> Option<HeldBuffer> {
        if self.held.replace(true) {
            return None;
        }
        Some(HeldBuffer::new(self.slot, self.src, self.dst, self.payload.len()))
    }

    pub(crate) fn is_held(&self) -> bool {
        self.held.get()
    }
}

impl fmt::Debug for RxMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxMessage")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("len", &self.payload.len())
            .field("held", &self.held.get())
            .finish()
    }
}

/// Snapshot of an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Name
    pub name: EndpointName,
    /// Local address
    pub addr: u32,
    /// Bound remote address, `RPMSG_ADDR_ANY` if unbound
    pub dest_addr: u32,
}

pub(crate) struct Endpoint {
    pub(crate) name: EndpointName,
    pub(crate) addr: u32,
    pub(crate) dest_addr: u32,
    pub(crate) callback: Arc<dyn EndpointCallback>,
}

impl Endpoint {
    pub(crate) fn info(&self) -> EndpointInfo {
        EndpointInfo { name: self.name.clone(), addr: self.addr, dest_addr: self.dest_addr }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.dest_addr != RPMSG_ADDR_ANY
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("dest_addr", &self.dest_addr)
            .finish()
    }
}

/// Cut `name` to fit an endpoint name
pub(crate) fn endpoint_name(name: &str) -> EndpointName {
    let mut out = EndpointName::new();
    for c in name.chars() {
        if out.len() + c.len_utf8() > RPMSG_NAME_SIZE - 1 || out.push(c).is_err() {
            break;
        }
    }
    out
}

const BMP_WORDS: usize = (RPMSG_ADDR_BMP_SIZE as usize).div_ceil(32);

/// Allocation state of the dynamic address range
#[derive(Debug, Clone, Default)]
pub(crate) struct AddressBitmap {
    bits: [u32; BMP_WORDS],
}

impl AddressBitmap {
    pub(crate) const fn new() -> Self {
        Self { bits: [0; BMP_WORDS] }
    }

    fn index(addr: u32) -> Option<usize> {
        addr.checked_sub(RPMSG_RESERVED_ADDRESSES)
            .filter(|&bit| bit < RPMSG_ADDR_BMP_SIZE)
            .map(|bit| bit as usize)
    }

    /// Whether `addr` falls in the dynamic range
    pub(crate) fn covers(addr: u32) -> bool {
        Self::index(addr).is_some()
    }

    /// Lowest free dynamic address
    pub(crate) fn alloc(&mut self) -> RpmsgResult<u32> {
        for bit in 0..RPMSG_ADDR_BMP_SIZE as usize {
            let (word, mask) = (bit / 32, 1u32 << (bit % 32));
            if self.bits[word] & mask == 0 {
                self.bits[word] |= mask;
                return Ok(RPMSG_RESERVED_ADDRESSES + bit as u32);
            }
        }
        Err(RpmsgError::Address)
    }

    /// Claim a specific dynamic address
    pub(crate) fn reserve(&mut self, addr: u32) -> RpmsgResult<()> {
        let bit = Self::index(addr).ok_or(RpmsgError::Address)?;
        let (word, mask) = (bit / 32, 1u32 << (bit % 32));
        if self.bits[word] & mask != 0 {
            return Err(RpmsgError::Address);
        }
        self.bits[word] |= mask;
        Ok(())
    }

    pub(crate) fn release(&mut self, addr: u32) {
        if let Some(bit) = Self::index(addr) {
            self.bits[bit / 32] &= !(1u32 << (bit % 32));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_alloc() {
        let mut bmp = AddressBitmap::new();
        assert_eq!(bmp.alloc().unwrap(), 1024);
        assert_eq!(bmp.alloc().unwrap(), 1025);
        bmp.reserve(1027).unwrap();
        assert_eq!(bmp.alloc().unwrap(), 1026);
        assert_eq!(bmp.alloc().unwrap(), 1028);
        bmp.release(1024);
        assert_eq!(bmp.alloc().unwrap(), 1024);
    }

    #[test]
    fn test_bitmap_exhaustion() {
        let mut bmp = AddressBitmap::new();
        for _ in 0..RPMSG_ADDR_BMP_SIZE {
            bmp.alloc().unwrap();
        }
        assert_eq!(bmp.alloc(), Err(RpmsgError::Address));
    }

    #[test]
    fn test_bitmap_reserve() {
        let mut bmp = AddressBitmap::new();
        assert_eq!(bmp.reserve(1030), Ok(()));
        assert_eq!(bmp.reserve(1030), Err(RpmsgError::Address));
        assert_eq!(bmp.reserve(0x35), Err(RpmsgError::Address));
        assert!(AddressBitmap::covers(1024 + 127));
        assert!(!AddressBitmap::covers(1024 + 128));
    }

    #[test]
    fn test_endpoint_name() {
        assert_eq!(endpoint_name("echo").as_str(), "echo");
        let long = "x".repeat(40);
        assert_eq!(endpoint_name(&long).len(), RPMSG_NAME_SIZE - 1);
    }
}
