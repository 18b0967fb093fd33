//! Ethernet frames for tests

use mvirt_netdev::device::{FrameMeta, FrameType};

pub const BROADCAST: [u8; 6] = [0xff; 6];
pub const CLIENT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x01];

/// Local experimental ethertype.
pub const ETHERTYPE: u16 = 0x88b5;

/// Ethernet frame carrying `seq` and padded to `len` bytes.
pub fn ethernet_frame(seq: u16, len: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&BROADCAST);
    frame.extend_from_slice(&CLIENT_MAC);
    frame.extend_from_slice(&ETHERTYPE.to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.resize(len.max(frame.len()), 0xa5);
    frame
}

/// Sequence number of a frame built by [`ethernet_frame`].
pub fn sequence(frame: &[u8]) -> Option<u16> {
    let bytes = frame.get(14..16)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Metadata for an Ethernet frame arriving on `port`.
pub fn ethernet_meta(port: u8) -> FrameMeta {
    FrameMeta {
        port,
        frame_type: FrameType::Ethernet.raw(),
        ..FrameMeta::default()
    }
}
