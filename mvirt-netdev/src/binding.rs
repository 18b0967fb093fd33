//! Control connections to a device interface.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::device::{DeviceInfo, PortStatus};
use crate::error::{Error, Result};
use crate::interface::DeviceInterface;
use crate::port::Port;
use crate::session::{SessionFifos, SessionHandle, SessionInfo};
use crate::watcher::{PortWatcher, StatusWatcher};

/// Port addressed by the device-level status calls.
const DEFAULT_PORT: u8 = 0;

/// Shared between a binding and the interface's binding list.
pub(crate) struct BindingState {
    id: u64,
    closed: AtomicBool,
}

impl BindingState {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Client control connection.
///
/// Every call fails with `Unavailable` once the interface starts tearing
/// down. Dropping the binding unbinds it.
pub struct DeviceBinding {
    device: Weak<DeviceInterface>,
    state: Arc<BindingState>,
}

impl fmt::Debug for DeviceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("id", &self.state.id)
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

impl DeviceBinding {
    pub(crate) fn new(device: Weak<DeviceInterface>, state: Arc<BindingState>) -> Self {
        Self { device, state }
    }

    fn device(&self) -> Result<Arc<DeviceInterface>> {
        if self.state.is_closed() {
            return Err(Error::Unavailable);
        }
        self.device.upgrade().ok_or(Error::Unavailable)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed() || self.device.strong_count() == 0
    }

    pub fn open_session(
        &self,
        name: &str,
        info: SessionInfo,
    ) -> Result<(SessionHandle, SessionFifos)> {
        self.device()?.open_session(name, info)
    }

    pub fn get_port(&self, id: u8) -> Result<Port> {
        self.device()?.get_port(id)
    }

    pub fn get_port_watcher(&self) -> Result<PortWatcher> {
        self.device()?.port_watcher()
    }

    pub fn get_info(&self) -> Result<DeviceInfo> {
        Ok(self.device()?.info().clone())
    }

    /// Status of the default port.
    pub fn get_status(&self) -> Result<PortStatus> {
        self.get_port(DEFAULT_PORT)?.status()
    }

    /// Watch the default port's status.
    pub fn get_status_watcher(&self, buffer: u32) -> Result<StatusWatcher> {
        self.get_port(DEFAULT_PORT)?.status_watcher(buffer)
    }
}

impl Drop for DeviceBinding {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            device.unbind(&self.state);
        }
    }
}
