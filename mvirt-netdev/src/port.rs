//! Device ports and session attachments.
//!
//! Ports live in a fixed table indexed by port id. Each time a slot is
//! filled its generation is bumped, and both [`AttachedPort`] records and
//! [`Port`] handles carry the generation they were created against, so a
//! stale reference to a removed (or replaced) port is detected on use.

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::device::{FrameType, MacAddress, NetworkPortImpl, PortInfo, PortStatus};
use crate::error::{Error, Result};
use crate::interface::DeviceInterface;
use crate::watcher::{MAX_STATUS_BUFFER, StatusWatcher, WatchQueue};

/// Size of the port table; port ids are `0..MAX_PORTS`.
pub const MAX_PORTS: usize = 32;

/// Maximum number of rx frame types a session may subscribe to per port.
pub const MAX_FRAME_TYPES: usize = 4;

/// Attachment of a session to one port.
///
/// Immutable after construction: re-attaching with different frame types
/// requires a detach first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedPort {
    port_id: u8,
    generation: u32,
    frame_types: Vec<FrameType>,
}

impl AttachedPort {
    pub(crate) fn new(port_id: u8, generation: u32, frame_types: Vec<FrameType>) -> Self {
        Self {
            port_id,
            generation,
            frame_types,
        }
    }

    pub fn port_id(&self) -> u8 {
        self.port_id
    }

    /// Generation of the port slot this attachment was made against.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Rx frame types this attachment accepts.
    pub fn frame_types(&self) -> &[FrameType] {
        &self.frame_types
    }

    /// Whether a frame of raw type `frame_type` passes the filter.
    pub fn accepts(&self, frame_type: u8) -> bool {
        self.frame_types.iter().any(|t| t.raw() == frame_type)
    }
}

/// Port as tracked by the device interface.
pub(crate) struct DevicePort {
    pub(crate) id: u8,
    pub(crate) generation: u32,
    pub(crate) port: Arc<dyn NetworkPortImpl>,
    pub(crate) info: PortInfo,
    pub(crate) status: PortStatus,
    pub(crate) mac: Option<MacAddress>,
    /// Number of sessions currently attached.
    pub(crate) attached_sessions: usize,
    status_watchers: Vec<Arc<WatchQueue<PortStatus>>>,
}

impl fmt::Debug for DevicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePort")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("info", &self.info)
            .field("status", &self.status)
            .field("attached_sessions", &self.attached_sessions)
            .finish()
    }
}

impl DevicePort {
    pub(crate) fn new(
        id: u8,
        generation: u32,
        port: Arc<dyn NetworkPortImpl>,
        info: PortInfo,
        status: PortStatus,
        mac: Option<MacAddress>,
    ) -> Self {
        Self {
            id,
            generation,
            port,
            info,
            status,
            mac,
            attached_sessions: 0,
            status_watchers: Vec::new(),
        }
    }

    /// Build an attachment, validating the requested rx frame types.
    pub(crate) fn attachment(&self, frame_types: &[FrameType]) -> Result<AttachedPort> {
        if frame_types.len() > MAX_FRAME_TYPES {
            return Err(Error::InvalidArgs);
        }
        if let Some(bad) = frame_types.iter().find(|t| !self.info.rx_types.contains(t)) {
            debug!(port_id = self.id, frame_type = ?bad, "Port does not support rx frame type");
            return Err(Error::InvalidArgs);
        }
        Ok(AttachedPort::new(
            self.id,
            self.generation,
            frame_types.to_vec(),
        ))
    }

    /// Whether the port transmits frames of raw type `frame_type`.
    pub(crate) fn supports_tx(&self, frame_type: u8) -> bool {
        self.info.tx_types.iter().any(|t| t.raw() == frame_type)
    }

    /// Register a status watcher seeded with the current status.
    pub(crate) fn bind_status_watcher(&mut self, buffer: u32) -> Result<StatusWatcher> {
        if buffer == 0 || buffer > MAX_STATUS_BUFFER {
            return Err(Error::InvalidArgs);
        }
        let queue = Arc::new(WatchQueue::new(buffer as usize));
        queue.push(self.status);
        self.status_watchers.retain(|w| !w.is_closed());
        self.status_watchers.push(Arc::clone(&queue));
        Ok(StatusWatcher::new(queue))
    }

    /// Record a new status and forward it to watchers. Repeats of the
    /// current status are not forwarded.
    pub(crate) fn set_status(&mut self, status: PortStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.status_watchers.retain(|w| w.push(status));
    }

    /// Close all status watchers.
    pub(crate) fn close_watchers(&mut self) {
        for watcher in self.status_watchers.drain(..) {
            watcher.close(Error::Canceled);
        }
    }
}

/// Client handle to one port.
#[derive(Clone)]
pub struct Port {
    device: Weak<DeviceInterface>,
    id: u8,
    generation: u32,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Port {
    pub(crate) fn new(device: Weak<DeviceInterface>, id: u8, generation: u32) -> Self {
        Self {
            device,
            id,
            generation,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    fn with_port<R>(&self, f: impl FnOnce(&mut DevicePort) -> Result<R>) -> Result<R> {
        let device = self.device.upgrade().ok_or(Error::PeerClosed)?;
        device.with_port(self.id, self.generation, f)
    }

    pub fn info(&self) -> Result<PortInfo> {
        self.with_port(|p| Ok(p.info.clone()))
    }

    pub fn status(&self) -> Result<PortStatus> {
        self.with_port(|p| Ok(p.status))
    }

    /// MAC address; `NotSupported` if the port has no addressing.
    pub fn mac(&self) -> Result<MacAddress> {
        self.with_port(|p| p.mac.ok_or(Error::NotSupported))
    }

    /// Watch status changes with room for `buffer` queued statuses.
    pub fn status_watcher(&self, buffer: u32) -> Result<StatusWatcher> {
        self.with_port(|p| p.bind_status_watcher(buffer))
    }
}
