//! Buffer descriptors and the per-session descriptor ring.
//!
//! Descriptors live in shared memory that the client writes directly, so
//! they are decoded from bytes on every access and validated by the caller
//! before use. The encoding is little-endian with the following layout:
//!
//! ```text
//! 0       frame_type     u8
//! 1       chain_length   u8
//! 2..4    nxt            u16
//! 4..8    info_type      u32
//! 8       port_id        u8
//! 9..16   reserved
//! 16..24  offset         u64
//! 24..26  head_length    u16
//! 26..28  tail_length    u16
//! 28..32  data_length    u32
//! 32..36  inbound_flags  u32
//! 36..40  return_flags   u32
//! ```

use crate::error::{Error, Result};
use crate::vmo::Vmo;

/// Size of an encoded descriptor in bytes.
pub const DESCRIPTOR_SIZE: usize = 40;

/// Descriptor layout version understood by this implementation.
pub const DESCRIPTOR_VERSION: u8 = 1;

/// `chain_length` must be strictly below this value.
pub const MAX_DESCRIPTOR_CHAIN: u8 = 4;

/// Info type value for frames without extra metadata.
pub const INFO_TYPE_NO_INFO: u32 = 0;

/// Rx frame flags reported in `inbound_flags`.
pub mod rx_flags {
    /// Frame is a copy of a frame transmitted by another session.
    pub const RX_ECHOED_TX: u32 = 1 << 31;
}

/// Tx return flags reported in `return_flags`.
pub mod tx_return {
    /// Frame was not transmitted.
    pub const TX_RET_ERROR: u32 = 1 << 31;
    /// Device does not support the requested frame.
    pub const TX_RET_NOT_SUPPORTED: u32 = 1 << 0;
    /// Device ran out of resources.
    pub const TX_RET_OUT_OF_RESOURCES: u32 = 1 << 1;
    /// Port or device is not available.
    pub const TX_RET_NOT_AVAILABLE: u32 = 1 << 2;
}

/// One buffer descriptor as stored in the descriptor ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub frame_type: u8,
    /// Number of descriptors that follow this one in the chain.
    pub chain_length: u8,
    /// Index of the next descriptor in the chain.
    pub nxt: u16,
    pub info_type: u32,
    pub port_id: u8,
    /// Offset of the buffer in the session's data VMO.
    pub offset: u64,
    pub head_length: u16,
    pub tail_length: u16,
    pub data_length: u32,
    pub inbound_flags: u32,
    pub return_flags: u32,
}

impl BufferDescriptor {
    /// Descriptor for a plain buffer of `data_length` bytes at `offset`.
    pub fn new(offset: u64, data_length: u32) -> Self {
        Self {
            offset,
            data_length,
            ..Self::default()
        }
    }

    /// Decode from the shared-memory encoding.
    pub fn from_bytes(raw: &[u8; DESCRIPTOR_SIZE]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&raw[16..24]);
        Self {
            frame_type: raw[0],
            chain_length: raw[1],
            nxt: u16_at(2),
            info_type: u32_at(4),
            port_id: raw[8],
            offset: u64::from_le_bytes(offset),
            head_length: u16_at(24),
            tail_length: u16_at(26),
            data_length: u32_at(28),
            inbound_flags: u32_at(32),
            return_flags: u32_at(36),
        }
    }

    /// Encode into the shared-memory layout.
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut raw = [0u8; DESCRIPTOR_SIZE];
        raw[0] = self.frame_type;
        raw[1] = self.chain_length;
        raw[2..4].copy_from_slice(&self.nxt.to_le_bytes());
        raw[4..8].copy_from_slice(&self.info_type.to_le_bytes());
        raw[8] = self.port_id;
        raw[16..24].copy_from_slice(&self.offset.to_le_bytes());
        raw[24..26].copy_from_slice(&self.head_length.to_le_bytes());
        raw[26..28].copy_from_slice(&self.tail_length.to_le_bytes());
        raw[28..32].copy_from_slice(&self.data_length.to_le_bytes());
        raw[32..36].copy_from_slice(&self.inbound_flags.to_le_bytes());
        raw[36..40].copy_from_slice(&self.return_flags.to_le_bytes());
        raw
    }

    /// Full extent of the buffer including head and tail space.
    pub fn buffer_length(&self) -> u64 {
        u64::from(self.head_length) + u64::from(self.data_length) + u64::from(self.tail_length)
    }

    /// Offset of the first payload byte in the data VMO.
    pub fn data_offset(&self) -> u64 {
        self.offset.saturating_add(u64::from(self.head_length))
    }
}

/// Descriptor ring backed by a VMO, addressed by `u16` index.
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    vmo: Vmo,
    count: u16,
    stride: u64,
}

impl DescriptorTable {
    /// Allocate a ring of `count` descriptors, each `length_words` 8-byte
    /// words long.
    pub fn allocate(count: u16, length_words: u8) -> Result<Self> {
        let stride = usize::from(length_words) * 8;
        if count == 0 || stride < DESCRIPTOR_SIZE {
            return Err(Error::InvalidArgs);
        }
        let vmo = Vmo::create(usize::from(count) * stride)?;
        Ok(Self {
            vmo,
            count,
            stride: stride as u64,
        })
    }

    /// Number of descriptors in the ring.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Backing memory, shared with the client.
    pub fn vmo(&self) -> &Vmo {
        &self.vmo
    }

    /// Read descriptor `index`, `None` if out of range.
    pub fn get(&self, index: u16) -> Option<BufferDescriptor> {
        if index >= self.count {
            return None;
        }
        let mut raw = [0u8; DESCRIPTOR_SIZE];
        self.vmo
            .read(u64::from(index) * self.stride, &mut raw)
            .ok()?;
        Some(BufferDescriptor::from_bytes(&raw))
    }

    /// Store descriptor `index`.
    pub fn set(&self, index: u16, desc: &BufferDescriptor) -> Result<()> {
        if index >= self.count {
            return Err(Error::OutOfRange);
        }
        self.vmo
            .write(u64::from(index) * self.stride, &desc.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        let desc = BufferDescriptor {
            frame_type: 0x11,
            chain_length: 2,
            nxt: 0x0304,
            info_type: 0,
            port_id: 13,
            offset: 0x0102_0304_0506_0708,
            head_length: 0x1122,
            tail_length: 0x3344,
            data_length: 0x5566_7788,
            inbound_flags: 0xAABB_CCDD,
            return_flags: 7,
        };
        let raw = desc.to_bytes();
        assert_eq!(raw[0], 0x11);
        assert_eq!(raw[1], 2);
        assert_eq!(&raw[2..4], &[0x04, 0x03]);
        assert_eq!(raw[8], 13);
        assert_eq!(&raw[9..16], &[0; 7]);
        assert_eq!(raw[16], 0x08);
        assert_eq!(&raw[28..32], &[0x88, 0x77, 0x66, 0x55]);
        assert_eq!(raw[36], 7);
        assert_eq!(BufferDescriptor::from_bytes(&raw), desc);
    }

    #[test]
    fn test_table_bounds() {
        let table = DescriptorTable::allocate(4, 5).unwrap();
        assert_eq!(table.vmo().len(), 4 * 40);
        assert!(table.get(3).is_some());
        assert!(table.get(4).is_none());
        assert_eq!(
            table.set(4, &BufferDescriptor::default()).unwrap_err(),
            Error::OutOfRange
        );
    }

    #[test]
    fn test_table_stride() {
        let table = DescriptorTable::allocate(2, 8).unwrap();
        table.set(1, &BufferDescriptor::new(4096, 512)).unwrap();
        assert_eq!(table.get(0).unwrap(), BufferDescriptor::default());
        assert_eq!(table.get(1).unwrap().offset, 4096);
        // Second descriptor starts one 64 byte stride in
        let raw = table.vmo().read_vec(64 + 16, 8).unwrap();
        assert_eq!(u64::from_le_bytes(raw.try_into().unwrap()), 4096);
    }

    #[test]
    fn test_table_rejects_short_descriptors() {
        assert_eq!(DescriptorTable::allocate(4, 4).unwrap_err(), Error::InvalidArgs);
        assert_eq!(DescriptorTable::allocate(0, 5).unwrap_err(), Error::InvalidArgs);
    }
}
