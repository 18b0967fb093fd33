//! In-memory port for tests and the demo device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::device::{DeviceClass, FrameType, MacAddress, NetworkPortImpl, PortInfo, PortStatus};

pub struct FakeNetworkPort {
    info: PortInfo,
    status: Mutex<PortStatus>,
    mac: Option<MacAddress>,
    active: AtomicBool,
    removed: AtomicBool,
}

impl FakeNetworkPort {
    pub fn new(info: PortInfo, status: PortStatus, mac: Option<MacAddress>) -> Self {
        Self {
            info,
            status: Mutex::new(status),
            mac,
            active: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    /// Online Ethernet port carrying Ethernet frames both ways.
    pub fn ethernet() -> Self {
        Self::new(
            PortInfo {
                class: DeviceClass::Ethernet,
                rx_types: vec![FrameType::Ethernet],
                tx_types: vec![FrameType::Ethernet],
            },
            PortStatus {
                mtu: 1500,
                online: true,
            },
            Some([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
        )
    }

    /// Update the status reported by `status()`. The device still has to be
    /// told through `DeviceIfc::port_status_changed`.
    pub fn set_status(&self, status: PortStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// At least one session is attached.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

impl NetworkPortImpl for FakeNetworkPort {
    fn info(&self) -> PortInfo {
        self.info.clone()
    }

    fn status(&self) -> PortStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    fn mac(&self) -> Option<MacAddress> {
        self.mac
    }

    fn removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }
}
