//! Device interface control plane tests: ports, watchers, device state and
//! teardown.

mod harness;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use harness::frames::ethernet_frame;
use harness::{PORT, SHORT, TestDevice, TestSession, WAIT, wait_until};
use mvirt_netdev::descriptor::tx_return;
use mvirt_netdev::device::{DeviceInfo, NetworkPortImpl, PortStatus};
use mvirt_netdev::state::{DeviceStatus, TeardownState};
use mvirt_netdev::test_util::{FakeEvent, FakeNetworkDevice, FakeNetworkPort};
use mvirt_netdev::vmo::MAX_VMOS;
use mvirt_netdev::watcher::PortEvent;
use mvirt_netdev::{DeviceInterface, Error, SessionFlags};

#[test]
fn test_teardown_closes_everything() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let session = t.open_running("a", 8, 4);
    assert!(t.driver.wait_rx_space(4, WAIT));
    let watcher = t.binding.get_port_watcher().expect("Failed to watch ports");
    assert_eq!(watcher.watch(WAIT), Ok(PortEvent::Existing(PORT)));
    assert_eq!(watcher.watch(WAIT), Ok(PortEvent::Idle));

    assert!(t.teardown(WAIT), "teardown callback never ran");

    assert_eq!(t.device.teardown_state(), TeardownState::Finished);
    assert_eq!(t.device.device_status(), DeviceStatus::Stopped);
    assert!(t.binding.is_closed());
    assert!(t.port.is_removed());
    assert_eq!(session.handle.wait_closed(WAIT), Ok(Error::Canceled));
    assert_eq!(watcher.watch(SHORT), Err(Error::Canceled));
    assert!(t.driver.vmo_ids().is_empty());

    let snapshot = t.device.snapshot();
    assert_eq!(snapshot.primary, None);
    assert!(snapshot.sessions.is_empty());
    assert!(snapshot.ports.is_empty());

    // Nothing new can be opened
    assert_eq!(t.device.bind().unwrap_err(), Error::Unavailable);
    assert_eq!(
        TestSession::open(&t.binding, "late", 4, SessionFlags::PRIMARY).err(),
        Some(Error::Unavailable)
    );
    assert_eq!(t.binding.get_info().unwrap_err(), Error::Unavailable);
}

#[test]
fn test_teardown_without_sessions() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    assert!(t.teardown(WAIT));
    assert!(t.port.is_removed());
    // The device never ran
    assert!(!t.driver.wait_for(SHORT, |e| *e == FakeEvent::Stop));

    // A second request is ignored and its callback never runs
    assert!(!t.teardown(SHORT));
}

#[test]
fn test_teardown_races_open_session() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let failure = std::thread::scope(|scope| {
        let opener = scope.spawn(|| {
            loop {
                match TestSession::open(&t.binding, "racer", 4, SessionFlags::PRIMARY) {
                    Ok(session) => {
                        let _ = session.attach(PORT);
                        drop(session);
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => return e,
                }
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        t.device.teardown(move || {
            let _ = done_tx.send(());
        });
        opener.join().expect("opener panicked")
    });

    assert_eq!(failure, Error::Unavailable);
    assert!(done_rx.recv_timeout(WAIT).is_ok());
    let snapshot = t.device.snapshot();
    assert_eq!(snapshot.teardown, TeardownState::Finished);
    assert_eq!(snapshot.primary, None);
    assert!(snapshot.sessions.is_empty());
    assert_eq!(snapshot.dead_sessions, 0);
}

#[test]
fn test_teardown_waits_for_device_stop() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    t.driver.set_auto_stop(false);
    let session = t.open_running("a", 8, 0);

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    t.device.teardown(move || {
        let _ = done_tx.send(());
    });
    assert_eq!(session.handle.wait_closed(WAIT), Ok(Error::Canceled));
    assert!(wait_until(WAIT, || t.driver.has_pending_stop()));
    assert_eq!(t.device.teardown_state(), TeardownState::Sessions);
    assert!(done_rx.recv_timeout(SHORT).is_err());

    assert!(t.driver.trigger_stop());
    assert!(done_rx.recv_timeout(WAIT).is_ok());
    assert_eq!(t.device.teardown_state(), TeardownState::Finished);
}

#[test]
fn test_late_events_do_not_advance_teardown() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    t.driver.set_auto_stop(false);
    let session = t.open_running("a", 8, 0);
    let late = t.device.bind().expect("Failed to bind");

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    t.device.teardown(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(session.handle.wait_closed(WAIT), Ok(Error::Canceled));
    assert!(wait_until(WAIT, || t.driver.has_pending_stop()));
    assert_eq!(t.device.teardown_state(), TeardownState::Sessions);

    // Events for phases already passed change nothing
    drop(late);
    let extra = Arc::new(FakeNetworkPort::ethernet());
    t.driver.add_port(2, extra.clone());
    assert!(extra.is_removed());
    t.driver.remove_port(PORT);
    t.driver.remove_port(2);
    assert_eq!(t.device.teardown_state(), TeardownState::Sessions);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(t.driver.trigger_stop());
    assert!(wait_until(WAIT, || calls.load(Ordering::SeqCst) == 1));
    assert_eq!(t.device.teardown_state(), TeardownState::Finished);

    // Nor after it finished
    t.driver.remove_port(PORT);
    assert!(!t.driver.trigger_stop());
    t.device.teardown(|| panic!("second teardown callback ran"));
    assert_eq!(t.device.teardown_state(), TeardownState::Finished);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_teardown_waits_for_buffers() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    t.driver.set_auto_stop(false);
    let session = t.open_running("a", 8, 4);
    assert!(t.driver.wait_rx_space(4, WAIT));
    session.send(4, PORT, &ethernet_frame(1, 64));
    assert!(t.driver.wait_tx(1, WAIT));

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    t.device.teardown(move || {
        let _ = done_tx.send(());
    });
    // The session is dead but the device still holds its buffers
    assert!(wait_until(WAIT, || t.device.snapshot().dead_sessions == 1));
    assert_eq!(session.handle.wait_closed(SHORT), Err(Error::TimedOut));

    // Stopping hands every buffer back
    assert!(t.driver.trigger_stop());
    assert!(done_rx.recv_timeout(WAIT).is_ok());
    assert_eq!(session.handle.wait_closed(WAIT), Ok(Error::Canceled));
}

#[test]
fn test_stop_returns_tx_as_unavailable() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let session = t.open_running("a", 8, 0);
    session.send(1, PORT, &ethernet_frame(1, 64));
    assert!(t.driver.wait_tx(1, WAIT));

    // Last primary leaving stops the device
    session.detach(PORT).expect("Failed to detach");
    let (index, desc) = session.read_tx(WAIT).expect("tx not returned");
    assert_eq!(index, 1);
    assert_eq!(
        desc.return_flags,
        tx_return::TX_RET_ERROR | tx_return::TX_RET_NOT_AVAILABLE
    );
    assert_eq!(t.device.device_status(), DeviceStatus::Stopped);
    assert!(!session.handle.is_closed());
}

#[test]
fn test_port_removal() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let session = t.open_running("a", 8, 0);
    let port = t.binding.get_port(PORT).expect("Failed to get port");
    let status = port.status_watcher(4).expect("Failed to watch status");
    assert_eq!(status.watch_status(WAIT), Ok(t.port.status()));

    t.driver.remove_port(PORT);
    assert!(t.port.is_removed());
    assert_eq!(t.device.device_status(), DeviceStatus::Stopped);
    assert_eq!(port.status().unwrap_err(), Error::PeerClosed);
    assert_eq!(status.watch_status(SHORT), Err(Error::Canceled));
    assert_eq!(session.attach(PORT).unwrap_err(), Error::NotFound);
    assert_eq!(t.binding.get_port(PORT).unwrap_err(), Error::NotFound);
    // The session survives, paused
    assert!(!session.handle.is_closed());

    // A port added under the same id is a new port
    t.driver.add_port(PORT, Arc::new(FakeNetworkPort::ethernet()));
    assert_eq!(port.status().unwrap_err(), Error::PeerClosed);
    let fresh = t.binding.get_port(PORT).expect("Failed to get port");
    assert!(fresh.status().is_ok());
    session.attach(PORT).expect("Failed to attach");
    assert_eq!(t.device.device_status(), DeviceStatus::Started);
}

#[test]
fn test_tx_to_removed_port_is_returned() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let extra = Arc::new(FakeNetworkPort::ethernet());
    t.driver.add_port(2, extra.clone());
    let session = t.open_running("a", 8, 0);
    session.attach(2).expect("Failed to attach");

    t.driver.remove_port(2);
    assert!(extra.is_removed());
    // Still attached to PORT, so the device keeps running
    assert_eq!(t.device.device_status(), DeviceStatus::Started);

    session.send(0, 2, &ethernet_frame(0, 64));
    let (_, desc) = session.read_tx(WAIT).expect("tx not returned");
    assert_eq!(
        desc.return_flags,
        tx_return::TX_RET_ERROR | tx_return::TX_RET_NOT_AVAILABLE
    );
}

#[test]
fn test_port_watcher() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let watcher = t.binding.get_port_watcher().expect("Failed to watch ports");
    assert_eq!(watcher.watch(WAIT), Ok(PortEvent::Existing(PORT)));
    assert_eq!(watcher.watch(WAIT), Ok(PortEvent::Idle));

    t.driver.add_port(2, Arc::new(FakeNetworkPort::ethernet()));
    t.driver.remove_port(2);
    assert_eq!(watcher.watch(WAIT), Ok(PortEvent::Added(2)));
    assert_eq!(watcher.watch(WAIT), Ok(PortEvent::Removed(2)));
    assert_eq!(watcher.watch(SHORT), Err(Error::TimedOut));

    // Duplicate ids are rejected and the port is told it was removed
    let duplicate = Arc::new(FakeNetworkPort::ethernet());
    t.driver.add_port(PORT, duplicate.clone());
    assert!(duplicate.is_removed());
    assert_eq!(watcher.watch(SHORT), Err(Error::TimedOut));
}

#[test]
fn test_port_status_changes() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let port = t.binding.get_port(PORT).expect("Failed to get port");
    assert_eq!(port.mac(), Ok([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]));
    let watcher = port.status_watcher(4).expect("Failed to watch status");
    let initial = watcher.watch_status(WAIT).expect("No initial status");
    assert!(initial.online);

    let offline = PortStatus {
        mtu: 1500,
        online: false,
    };
    t.port.set_status(offline);
    let ifc = t.driver.ifc().expect("Driver not initialized");
    ifc.port_status_changed(PORT, offline);
    // Repeats are not reported
    ifc.port_status_changed(PORT, offline);
    assert_eq!(watcher.watch_status(WAIT), Ok(offline));
    assert_eq!(watcher.watch_status(SHORT), Err(Error::TimedOut));
    assert_eq!(port.status(), Ok(offline));

    // The device-level status calls address port 0
    assert_eq!(t.binding.get_status().unwrap_err(), Error::NotFound);
    assert_eq!(port.status_watcher(0).err(), Some(Error::InvalidArgs));
}

#[test]
fn test_start_failure_leaves_device_stopped() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    t.driver.set_auto_start(false);
    let session = t.open("a", 8, SessionFlags::PRIMARY);
    session.attach(PORT).expect("Failed to attach");
    assert!(t.driver.wait_for(WAIT, |e| *e == FakeEvent::Start));
    assert_eq!(t.device.device_status(), DeviceStatus::Starting);

    assert!(t.driver.fail_start());
    assert_eq!(t.device.device_status(), DeviceStatus::Stopped);
    // No retry
    assert!(!t.driver.wait_for(SHORT, |e| *e == FakeEvent::Start));
}

#[test]
fn test_stop_requested_while_starting() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    t.driver.set_auto_start(false);
    let session = t.open("a", 8, SessionFlags::PRIMARY);
    session.attach(PORT).expect("Failed to attach");
    session.detach(PORT).expect("Failed to detach");
    assert_eq!(t.device.device_status(), DeviceStatus::Starting);

    // The queued stop is issued once the start completes
    assert!(t.driver.trigger_start());
    assert!(t.driver.wait_for(WAIT, |e| *e == FakeEvent::Stop));
    assert_eq!(t.device.device_status(), DeviceStatus::Stopped);
}

#[test]
fn test_vmo_store_limit() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let sessions: Vec<TestSession> = (0..MAX_VMOS)
        .map(|i| t.open(&format!("s{i}"), 1, SessionFlags::PRIMARY))
        .collect();
    assert_eq!(
        TestSession::open(&t.binding, "extra", 1, SessionFlags::PRIMARY).err(),
        Some(Error::NoResources)
    );

    // Closing one frees its slot
    let first = &sessions[0];
    first.handle.close();
    assert_eq!(first.handle.wait_closed(WAIT), Ok(Error::Canceled));
    assert!(TestSession::open(&t.binding, "extra", 1, SessionFlags::PRIMARY).is_ok());
}

#[test]
fn test_prepare_vmo_failure() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    t.driver.set_fail_prepare(true);
    assert_eq!(
        TestSession::open(&t.binding, "a", 4, SessionFlags::PRIMARY).err(),
        Some(Error::NoResources)
    );

    t.driver.set_fail_prepare(false);
    let session = t.open("a", 4, SessionFlags::PRIMARY);
    assert_eq!(t.driver.vmo_ids().len(), 1);
    drop(session);
    assert!(wait_until(WAIT, || t.driver.vmo_ids().is_empty()));
}

#[test]
fn test_invalid_device_info_rejected() {
    let _ = tracing_subscriber::fmt::try_init();
    let info = DeviceInfo {
        rx_threshold: 32,
        rx_depth: 16,
        ..DeviceInfo::default()
    };
    let driver = FakeNetworkDevice::with_info(info);
    assert_eq!(
        DeviceInterface::create(driver).err(),
        Some(Error::NotSupported)
    );
}

#[test]
fn test_binding_reports_device_info() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    assert_eq!(t.binding.get_info(), Ok(DeviceInfo::default()));
    assert!(!t.binding.is_closed());

    let second = t.device.bind().expect("Failed to bind");
    drop(second);
    // Dropping one binding leaves the others alone
    assert!(!t.binding.is_closed());
    assert!(t.binding.get_port(PORT).is_ok());
}
