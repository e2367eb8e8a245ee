//! # Wire Formats
//!
//! Every message buffer starts with an [`RpmsgHeader`]; name service
//! payloads are [`NsMessage`]s. Both are little endian on the wire.

use crate::{RpmsgError, RpmsgResult, RPMSG_NAME_SIZE};
use static_assertions::const_assert_eq;

/// Header in front of every message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RpmsgHeader {
    /// Source address
    pub src: u32,
    /// Destination address
    pub dst: u32,
    /// Reserved
    pub reserved: u32,
    /// Payload length
    pub len: u16,
    /// Message flags
    pub flags: u16,
}

const_assert_eq!(core::mem::size_of::<RpmsgHeader>(), RpmsgHeader::SIZE);

impl RpmsgHeader {
    /// Encoded size
    pub const SIZE: usize = 16;

    /// Header for `len` payload bytes from `src` to `dst`
    pub const fn new(src: u32, dst: u32, len: u16) -> Self {
        Self { src, dst, reserved: 0, len, flags: 0 }
    }

    /// Encode to wire format
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.src.to_le_bytes());
        out[4..8].copy_from_slice(&self.dst.to_le_bytes());
        out[8..12].copy_from_slice(&self.reserved.to_le_bytes());
        out[12..14].copy_from_slice(&self.len.to_le_bytes());
        out[14..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Decode from wire format
    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            src: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            dst: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            reserved: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            len: u16::from_le_bytes([raw[12], raw[13]]),
            flags: u16::from_le_bytes([raw[14], raw[15]]),
        }
    }
}

/// Name service operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NsFlags {
    /// An endpoint was created
    Create = 0,
    /// An endpoint was destroyed
    Destroy = 1,
}

/// Name service announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NsMessage {
    /// NUL padded endpoint name
    pub name: [u8; RPMSG_NAME_SIZE],
    /// Endpoint address
    pub addr: u32,
    /// Operation
    pub flags: NsFlags,
}

#[repr(C)]
struct RawNsMessage {
    name: [u8; RPMSG_NAME_SIZE],
    addr: u32,
    flags: u32,
}

const_assert_eq!(core::mem::size_of::<RawNsMessage>(), NsMessage::SIZE);

impl NsMessage {
    /// Encoded size
    pub const SIZE: usize = 40;

    /// Announcement for endpoint `name` at `addr`
    ///
    /// Names longer than `RPMSG_NAME_SIZE - 1` bytes are cut.
    pub fn new(name: &str, addr: u32, flags: NsFlags) -> Self {
        let mut raw = [0u8; RPMSG_NAME_SIZE];
        let len = name.len().min(RPMSG_NAME_SIZE - 1);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self { name: raw, addr, flags }
    }

    /// Name up to the first NUL
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(RPMSG_NAME_SIZE);
        match core::str::from_utf8(&self.name[..end]) {
            Ok(name) => name,
            Err(err) => core::str::from_utf8(&self.name[..err.valid_up_to()]).unwrap_or(""),
        }
    }

    /// Encode to wire format
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..RPMSG_NAME_SIZE].copy_from_slice(&self.name);
        out[32..36].copy_from_slice(&self.addr.to_le_bytes());
        out[36..40].copy_from_slice(&(self.flags as u32).to_le_bytes());
        out
    }

    /// Decode from wire format
    pub fn from_bytes(raw: &[u8]) -> RpmsgResult<Self> {
        if raw.len() < Self::SIZE {
            return Err(RpmsgError::BufferSize);
        }
        let mut name = [0u8; RPMSG_NAME_SIZE];
        name.copy_from_slice(&raw[..RPMSG_NAME_SIZE]);
        let addr = u32::from_le_bytes([raw[32], raw[33], raw[34], raw[35]]);
        let flags = match u32::from_le_bytes([raw[36], raw[37], raw[38], raw[39]]) {
            0 => NsFlags::Create,
            1 => NsFlags::Destroy,
            _ => return Err(RpmsgError::Param),
        };
        Ok(Self { name, addr, flags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let hdr = RpmsgHeader::new(0x400, 0x35, 40);
        let raw = hdr.to_bytes();
        assert_eq!(&raw[0..4], &[0x00, 0x04, 0x00, 0x00]);
        assert_eq!(&raw[4..8], &[0x35, 0, 0, 0]);
        assert_eq!(&raw[12..14], &[40, 0]);
        assert_eq!(RpmsgHeader::from_bytes(&raw), hdr);
    }

    #[test]
    fn test_ns_message() {
        let msg = NsMessage::new("rpmsg-openamp-demo-channel", 0x401, NsFlags::Destroy);
        let raw = msg.to_bytes();
        assert_eq!(raw[36], 1);
        let back = NsMessage::from_bytes(&raw).unwrap();
        assert_eq!(back.name(), "rpmsg-openamp-demo-channel");
        assert_eq!(back.addr, 0x401);
        assert_eq!(back.flags, NsFlags::Destroy);
    }

    #[test]
    fn test_ns_name_truncated() {
        let long = "a-very-long-endpoint-name-exceeding-32-bytes";
        let msg = NsMessage::new(long, 1, NsFlags::Create);
        assert_eq!(msg.name().len(), RPMSG_NAME_SIZE - 1);
        assert_eq!(msg.name[RPMSG_NAME_SIZE - 1], 0);
    }

    #[test]
    fn test_ns_bad_input() {
        assert_eq!(NsMessage::from_bytes(&[0u8; 16]), Err(RpmsgError::BufferSize));
        let mut raw = NsMessage::new("x", 1, NsFlags::Create).to_bytes();
        raw[36] = 7;
        assert_eq!(NsMessage::from_bytes(&raw), Err(RpmsgError::Param));
    }
}
