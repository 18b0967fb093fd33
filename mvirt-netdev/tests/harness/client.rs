//! Client side of a session
//!
//! Owns the data VMO and the client FIFO ends. Descriptor `i` always maps
//! to the buffer at `i * BUFFER_SIZE`.

use std::ops::Range;
use std::time::Duration;

use mvirt_netdev::descriptor::BufferDescriptor;
use mvirt_netdev::device::FrameType;
use mvirt_netdev::vmo::Vmo;
use mvirt_netdev::{DeviceBinding, Result, SessionFifos, SessionFlags, SessionHandle, SessionInfo};

/// Size of each client buffer.
pub const BUFFER_SIZE: u64 = 2048;

/// Frame read back from the rx FIFO.
#[derive(Debug)]
pub struct RxFrame {
    pub index: u16,
    pub descriptor: BufferDescriptor,
    pub payload: Vec<u8>,
}

pub struct TestSession {
    pub handle: SessionHandle,
    pub fifos: SessionFifos,
    pub data: Vmo,
}

impl TestSession {
    pub fn open(
        binding: &DeviceBinding,
        name: &str,
        count: u16,
        flags: SessionFlags,
    ) -> Result<Self> {
        let data = Vmo::create(usize::from(count) * BUFFER_SIZE as usize)?;
        let info = SessionInfo::new(data.clone(), count).with_flags(flags);
        let (handle, fifos) = binding.open_session(name, info)?;
        Ok(Self {
            handle,
            fifos,
            data,
        })
    }

    pub fn attach(&self, port: u8) -> Result<()> {
        self.handle.attach(port, &[FrameType::Ethernet])
    }

    pub fn detach(&self, port: u8) -> Result<()> {
        self.handle.detach(port)
    }

    fn offset(index: u16) -> u64 {
        u64::from(index) * BUFFER_SIZE
    }

    /// Hand descriptors to the session as rx space.
    pub fn offer_rx(&self, indices: Range<u16>) {
        let indices: Vec<u16> = indices.collect();
        for &index in &indices {
            let desc = BufferDescriptor::new(Self::offset(index), BUFFER_SIZE as u32);
            self.handle
                .descriptors()
                .set(index, &desc)
                .expect("Failed to write rx descriptor");
        }
        let written = self.fifos.rx.write(&indices).expect("Failed to write rx FIFO");
        assert_eq!(written, indices.len(), "rx FIFO full");
    }

    /// Queue `payload` for transmission on `port` using descriptor `index`.
    pub fn send(&self, index: u16, port: u8, payload: &[u8]) {
        self.send_descriptor(
            index,
            BufferDescriptor {
                port_id: port,
                frame_type: FrameType::Ethernet.raw(),
                ..BufferDescriptor::new(Self::offset(index), payload.len() as u32)
            },
            payload,
        );
    }

    /// Queue a raw descriptor, writing `payload` at its data offset.
    pub fn send_descriptor(&self, index: u16, desc: BufferDescriptor, payload: &[u8]) {
        if !payload.is_empty() {
            self.data
                .write(desc.data_offset(), payload)
                .expect("Failed to write tx payload");
        }
        self.handle
            .descriptors()
            .set(index, &desc)
            .expect("Failed to write tx descriptor");
        self.fifos.tx.write_one(index).expect("Failed to write tx FIFO");
    }

    /// Queue `payload` split across a descriptor chain. Part `i` holds
    /// `sizes[i]` bytes in the buffer of `indices[i]`; only the head index is
    /// written to the tx FIFO.
    pub fn send_chain(&self, indices: &[u16], port: u8, payload: &[u8], sizes: &[usize]) {
        assert_eq!(indices.len(), sizes.len());
        assert_eq!(sizes.iter().sum::<usize>(), payload.len());
        let mut rest = payload;
        for (i, (&index, &size)) in indices.iter().zip(sizes).enumerate() {
            let (part, tail) = rest.split_at(size);
            rest = tail;
            let desc = BufferDescriptor {
                port_id: port,
                frame_type: FrameType::Ethernet.raw(),
                chain_length: (indices.len() - 1 - i) as u8,
                nxt: indices.get(i + 1).copied().unwrap_or(0),
                ..BufferDescriptor::new(Self::offset(index), size as u32)
            };
            self.data
                .write(desc.data_offset(), part)
                .expect("Failed to write tx payload");
            self.handle
                .descriptors()
                .set(index, &desc)
                .expect("Failed to write tx descriptor");
        }
        self.fifos
            .tx
            .write_one(indices[0])
            .expect("Failed to write tx FIFO");
    }

    /// Next received frame.
    pub fn read_rx(&self, timeout: Duration) -> Option<RxFrame> {
        let index = self.fifos.rx.read_timeout(timeout).ok()?;
        let descriptor = self.handle.descriptors().get(index)?;
        let payload = self
            .data
            .read_vec(descriptor.data_offset(), descriptor.data_length as usize)
            .ok()?;
        Some(RxFrame {
            index,
            descriptor,
            payload,
        })
    }

    /// Next completed tx descriptor.
    pub fn read_tx(&self, timeout: Duration) -> Option<(u16, BufferDescriptor)> {
        let index = self.fifos.tx.read_timeout(timeout).ok()?;
        let descriptor = self.handle.descriptors().get(index)?;
        Some((index, descriptor))
    }
}
