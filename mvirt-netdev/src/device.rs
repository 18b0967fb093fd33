//! Device driver interface.
//!
//! The multiplexer sits on top of a driver implementing
//! [`NetworkDeviceImpl`]. Drivers report ports and buffer completions back
//! through the [`DeviceIfc`] handed to them in `init`, and finish the
//! asynchronous start/stop operations through a [`DeviceOpCompleter`].
//!
//! Call discipline: `start`, `stop`, `release_vmo` and the port callbacks are
//! invoked with no multiplexer lock held and may complete synchronously.
//! `queue_tx`, `queue_rx_space` and `prepare_vmo` are invoked while a queue
//! or control lock is held; drivers must not call back into [`DeviceIfc`]
//! from inside them.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};
use crate::interface::DeviceInterface;
use crate::state::DeviceOp;
use crate::vmo::Vmo;

/// Maximum rx/tx depth and session descriptor count.
pub const MAX_FIFO_DEPTH: u16 = 2048;

/// Maximum number of acceleration flags a device may declare per direction.
pub const MAX_ACCEL_FLAGS: usize = 16;

/// Device feature: do not copy transmitted frames to listen sessions.
pub const FEATURE_NO_AUTO_SNOOP: u32 = 1 << 0;

/// Layer of the frames carried in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FrameType {
    Ethernet = 1,
    Ipv4 = 2,
    Ipv6 = 3,
}

impl FrameType {
    /// Decode the value stored in a descriptor.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(FrameType::Ethernet),
            2 => Some(FrameType::Ipv4),
            3 => Some(FrameType::Ipv6),
            _ => None,
        }
    }

    /// Value stored in a descriptor.
    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// Kind of network interface a port represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Virtual,
    Ethernet,
    Wlan,
    Ppp,
    Bridge,
}

/// Capabilities reported once by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    /// Number of tx buffers the device can hold.
    pub tx_depth: u16,
    /// Number of rx space buffers the device can hold.
    pub rx_depth: u16,
    /// Minimum number of free rx slots before space is queued again.
    pub rx_threshold: u16,
    /// Rx space regions are clamped to this length, 0 for no limit.
    pub max_buffer_length: u32,
    /// Required alignment of rx space regions.
    pub buffer_alignment: u32,
    pub min_rx_buffer_length: u32,
    pub min_tx_buffer_length: u32,
    /// Head space the device needs in front of tx payloads.
    pub tx_head_length: u16,
    /// Tail space the device needs after tx payloads.
    pub tx_tail_length: u16,
    pub rx_accel: Vec<u8>,
    pub tx_accel: Vec<u8>,
    /// Device feature flags (`FEATURE_*`).
    pub features: u32,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            tx_depth: 16,
            rx_depth: 16,
            rx_threshold: 8,
            max_buffer_length: 2048,
            buffer_alignment: 1,
            min_rx_buffer_length: 0,
            min_tx_buffer_length: 0,
            tx_head_length: 0,
            tx_tail_length: 0,
            rx_accel: Vec::new(),
            tx_accel: Vec::new(),
            features: 0,
        }
    }
}

impl DeviceInfo {
    /// Reject capabilities the multiplexer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_alignment == 0 {
            error!("Device reports zero buffer alignment");
            return Err(Error::NotSupported);
        }
        if self.rx_threshold > self.rx_depth {
            error!(
                rx_threshold = self.rx_threshold,
                rx_depth = self.rx_depth,
                "Device rx threshold exceeds rx depth"
            );
            return Err(Error::NotSupported);
        }
        if self.rx_accel.len() > MAX_ACCEL_FLAGS || self.tx_accel.len() > MAX_ACCEL_FLAGS {
            error!(
                rx_accel = self.rx_accel.len(),
                tx_accel = self.tx_accel.len(),
                "Device reports too many acceleration flags"
            );
            return Err(Error::NotSupported);
        }
        for (direction, depth) in [("rx", self.rx_depth), ("tx", self.tx_depth)] {
            if depth == 0 || depth > MAX_FIFO_DEPTH {
                error!(direction, depth, "Device depth out of range");
                return Err(Error::NotSupported);
            }
        }
        Ok(())
    }
}

/// Static description of a port.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortInfo {
    pub class: DeviceClass,
    /// Frame types the port can deliver.
    pub rx_types: Vec<FrameType>,
    /// Frame types the port can transmit.
    pub tx_types: Vec<FrameType>,
}

/// Dynamic port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortStatus {
    pub mtu: u32,
    pub online: bool,
}

/// Unicast MAC address of a port.
pub type MacAddress = [u8; 6];

/// Region of a registered VMO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferRegion {
    pub offset: u64,
    pub length: u64,
}

/// Frame metadata carried with rx and tx buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMeta {
    pub port: u8,
    pub frame_type: u8,
    pub info_type: u32,
    pub flags: u32,
}

/// Frame handed to the driver for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxBuffer {
    /// Identifier echoed back in the matching [`TxResult`].
    pub id: u32,
    pub vmo_id: u8,
    pub meta: FrameMeta,
    /// Head space included at the start of the first part.
    pub head_length: u16,
    /// Tail space included at the end of the last part.
    pub tail_length: u16,
    pub parts: Vec<BufferRegion>,
}

/// Empty buffer handed to the driver to receive into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxSpaceBuffer {
    /// Identifier echoed back in the matching [`RxBuffer`].
    pub id: u32,
    pub vmo_id: u8,
    pub region: BufferRegion,
}

/// Received frame reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxBuffer {
    /// Identifier of the space buffer the frame was written into.
    pub id: u32,
    pub meta: FrameMeta,
    /// Bytes written at the start of the space region, 0 to return the
    /// space unused.
    pub length: u32,
}

impl RxBuffer {
    /// Return space `id` without a frame in it.
    pub fn unused(id: u32) -> Self {
        Self {
            id,
            meta: FrameMeta::default(),
            length: 0,
        }
    }
}

/// Transmission outcome reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ok,
    NotSupported,
    NoResources,
    Unavailable,
    Failed,
}

/// Completion of one [`TxBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxResult {
    pub id: u32,
    pub status: TxStatus,
}

/// Network device driver.
pub trait NetworkDeviceImpl: Send + Sync {
    /// Called once when the multiplexer is created.
    fn init(&self, ifc: DeviceIfc) -> Result<()>;

    /// Device capabilities; read once.
    fn info(&self) -> DeviceInfo;

    /// Start the data path. Finish by calling `completer.complete()`.
    fn start(&self, completer: DeviceOpCompleter);

    /// Stop the data path. The driver must report every outstanding buffer
    /// or drop it before completing; the multiplexer reclaims whatever is
    /// left once stopped.
    fn stop(&self, completer: DeviceOpCompleter);

    /// Frames to transmit.
    fn queue_tx(&self, buffers: Vec<TxBuffer>);

    /// Space to receive into.
    fn queue_rx_space(&self, buffers: Vec<RxSpaceBuffer>);

    /// A session data VMO became available under `id`.
    fn prepare_vmo(&self, id: u8, vmo: Vmo) -> Result<()>;

    /// The VMO registered under `id` is no longer referenced.
    fn release_vmo(&self, id: u8);
}

/// Port exposed by a device driver.
pub trait NetworkPortImpl: Send + Sync {
    fn info(&self) -> PortInfo;

    fn status(&self) -> PortStatus;

    /// Called when the first session attaches (`true`) or the last session
    /// detaches (`false`).
    fn set_active(&self, active: bool);

    /// MAC address, if the port supports addressing.
    fn mac(&self) -> Option<MacAddress>;

    /// The port was removed from the multiplexer.
    fn removed(&self);
}

/// Callbacks from the driver into the multiplexer.
#[derive(Clone)]
pub struct DeviceIfc {
    device: Weak<DeviceInterface>,
}

impl fmt::Debug for DeviceIfc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIfc")
            .field("alive", &(self.device.strong_count() > 0))
            .finish()
    }
}

impl DeviceIfc {
    pub(crate) fn new(device: Weak<DeviceInterface>) -> Self {
        Self { device }
    }

    /// A port appeared on the device.
    pub fn add_port(&self, id: u8, port: Arc<dyn NetworkPortImpl>) {
        match self.device.upgrade() {
            Some(device) => device.add_port(id, port),
            None => port.removed(),
        }
    }

    /// A port went away.
    pub fn remove_port(&self, id: u8) {
        if let Some(device) = self.device.upgrade() {
            device.remove_port(id);
        }
    }

    /// Status of a port changed.
    pub fn port_status_changed(&self, id: u8, status: PortStatus) {
        if let Some(device) = self.device.upgrade() {
            device.port_status_changed(id, status);
        }
    }

    /// Rx space buffers were filled (or returned unused).
    pub fn complete_rx(&self, buffers: &[RxBuffer]) {
        if let Some(device) = self.device.upgrade() {
            device.complete_rx(buffers);
        }
    }

    /// Tx buffers were transmitted (or failed).
    pub fn complete_tx(&self, results: &[TxResult]) {
        if let Some(device) = self.device.upgrade() {
            device.complete_tx(results);
        }
    }
}

/// Completion token for an asynchronous start or stop.
pub struct DeviceOpCompleter {
    device: Weak<DeviceInterface>,
    op: DeviceOp,
}

impl fmt::Debug for DeviceOpCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceOpCompleter")
            .field("op", &self.op)
            .finish()
    }
}

impl DeviceOpCompleter {
    pub(crate) fn new(device: Weak<DeviceInterface>, op: DeviceOp) -> Self {
        Self { device, op }
    }

    /// Operation this completer finishes.
    pub fn op(&self) -> DeviceOp {
        self.op
    }

    /// The operation succeeded.
    pub fn complete(self) {
        if let Some(device) = self.device.upgrade() {
            match self.op {
                DeviceOp::Start => device.device_started(),
                DeviceOp::Stop => device.device_stopped(),
            }
        }
    }

    /// The operation failed. There is no automatic retry: a failed start
    /// leaves the device stopped and a failed stop is treated as stopped.
    pub fn fail(self, error: Error) {
        error!(op = ?self.op, error = %error, "Device operation failed");
        if let Some(device) = self.device.upgrade() {
            match self.op {
                DeviceOp::Start => device.device_start_failed(),
                DeviceOp::Stop => device.device_stopped(),
            }
        }
    }
}
