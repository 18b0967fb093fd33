//! Test harness for device interface integration tests
//!
//! Wraps the fake driver, the device interface and the client side of
//! sessions so tests can move frames with a few calls.

#![allow(dead_code)]

pub mod client;
pub mod frames;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mvirt_netdev::device::DeviceInfo;
use mvirt_netdev::test_util::{FakeNetworkDevice, FakeNetworkPort};
use mvirt_netdev::{DeviceBinding, DeviceInterface, SessionFlags};

pub use client::{BUFFER_SIZE, RxFrame, TestSession};

/// Port every test device exposes.
pub const PORT: u8 = 13;

/// Upper bound for anything that should happen.
pub const WAIT: Duration = Duration::from_secs(5);

/// How long to wait before concluding something did not happen.
pub const SHORT: Duration = Duration::from_millis(100);

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Fake device with one Ethernet port and an open binding.
pub struct TestDevice {
    pub driver: Arc<FakeNetworkDevice>,
    pub device: Arc<DeviceInterface>,
    pub port: Arc<FakeNetworkPort>,
    pub binding: DeviceBinding,
}

impl TestDevice {
    pub fn new() -> Self {
        Self::with_info(DeviceInfo::default())
    }

    pub fn with_info(info: DeviceInfo) -> Self {
        let driver = FakeNetworkDevice::with_info(info);
        let device =
            DeviceInterface::create(driver.clone()).expect("Failed to create device interface");
        let port = Arc::new(FakeNetworkPort::ethernet());
        driver.add_port(PORT, port.clone());
        let binding = device.bind().expect("Failed to bind");
        Self {
            driver,
            device,
            port,
            binding,
        }
    }

    /// Open a session with `count` descriptors.
    pub fn open(&self, name: &str, count: u16, flags: SessionFlags) -> TestSession {
        TestSession::open(&self.binding, name, count, flags).expect("Failed to open session")
    }

    /// Open a primary session, attach it to [`PORT`] and hand the first
    /// `rx` descriptors to the device.
    pub fn open_running(&self, name: &str, count: u16, rx: u16) -> TestSession {
        let session = self.open(name, count, SessionFlags::PRIMARY);
        session.attach(PORT).expect("Failed to attach");
        session.offer_rx(0..rx);
        session
    }

    /// Name of the current primary session.
    pub fn primary(&self) -> Option<String> {
        self.device.snapshot().primary
    }

    /// Start teardown and wait for its callback.
    pub fn teardown(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.device.teardown(move || {
            let _ = done_tx.send(());
        });
        done_rx.recv_timeout(timeout).is_ok()
    }
}
