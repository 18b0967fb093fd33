//! Listen session tests
//!
//! Listen sessions get copies of frames other sessions transmit on ports
//! they are attached to, flagged as echoed, next to ordinary rx copies.

mod harness;

use std::sync::Arc;

use harness::frames::{ethernet_frame, ethernet_meta, sequence};
use harness::{PORT, SHORT, TestDevice, WAIT};
use mvirt_netdev::SessionFlags;
use mvirt_netdev::descriptor::rx_flags;
use mvirt_netdev::device::{DeviceInfo, FEATURE_NO_AUTO_SNOOP, FrameType};
use mvirt_netdev::test_util::FakeNetworkPort;

#[test]
fn test_listen_gets_tx_copy() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let sender = t.open_running("sender", 8, 0);
    let listener = t.open("listener", 8, SessionFlags::LISTEN_TX);
    listener.attach(PORT).expect("Failed to attach");
    listener.offer_rx(0..4);
    // Listen-only sessions never become primary
    assert_eq!(t.primary().as_deref(), Some("sender"));

    let frame = ethernet_frame(9, 200);
    sender.send(4, PORT, &frame);

    let copy = listener.read_rx(WAIT).expect("No tx copy");
    assert_eq!(copy.payload, frame);
    assert_eq!(copy.descriptor.port_id, PORT);
    assert_eq!(copy.descriptor.frame_type, FrameType::Ethernet.raw());
    assert_ne!(copy.descriptor.inbound_flags & rx_flags::RX_ECHOED_TX, 0);

    // The frame still goes out
    assert!(t.driver.wait_tx(1, WAIT));
    // The sender does not hear itself
    assert!(sender.read_rx(SHORT).is_none());
}

#[test]
fn test_listen_filters_by_port() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    t.driver.add_port(2, Arc::new(FakeNetworkPort::ethernet()));
    let sender = t.open_running("sender", 8, 0);
    sender.attach(2).expect("Failed to attach");
    let listener = t.open("listener", 8, SessionFlags::LISTEN_TX);
    listener.attach(PORT).expect("Failed to attach");
    listener.offer_rx(0..4);

    sender.send(4, 2, &ethernet_frame(1, 64));
    assert!(t.driver.wait_tx(1, WAIT));
    assert!(listener.read_rx(SHORT).is_none());

    sender.send(5, PORT, &ethernet_frame(2, 64));
    let copy = listener.read_rx(WAIT).expect("No tx copy");
    assert_eq!(sequence(&copy.payload), Some(2));
    assert_eq!(copy.descriptor.port_id, PORT);
}

#[test]
fn test_listen_gets_rx_copy() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let owner = t.open_running("owner", 8, 4);
    let listener = t.open("listener", 8, SessionFlags::LISTEN_TX);
    listener.attach(PORT).expect("Failed to attach");
    listener.offer_rx(0..4);
    assert!(t.driver.wait_rx_space(4, WAIT));

    let frame = ethernet_frame(3, 90);
    assert!(t.driver.receive(ethernet_meta(PORT), &frame));

    let original = owner.read_rx(WAIT).expect("Owner got no frame");
    let copy = listener.read_rx(WAIT).expect("Listener got no copy");
    assert_eq!(original.payload, frame);
    assert_eq!(copy.payload, frame);
    assert_eq!(copy.descriptor.inbound_flags & rx_flags::RX_ECHOED_TX, 0);
}

#[test]
fn test_listen_copies_in_order() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let sender = t.open_running("sender", 16, 0);
    let listener = t.open("listener", 16, SessionFlags::LISTEN_TX);
    listener.attach(PORT).expect("Failed to attach");
    listener.offer_rx(0..8);

    for seq in 0..8 {
        sender.send(seq, PORT, &ethernet_frame(seq, 64));
    }
    for seq in 0..8 {
        let copy = listener.read_rx(WAIT).expect("Missing tx copy");
        assert_eq!(sequence(&copy.payload), Some(seq));
    }
    // Out of rx space: further copies are dropped, not queued
    sender.send(8, PORT, &ethernet_frame(8, 64));
    assert!(t.driver.wait_tx(9, WAIT));
    assert!(listener.read_rx(SHORT).is_none());
}

#[test]
fn test_no_auto_snoop() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::with_info(DeviceInfo {
        features: FEATURE_NO_AUTO_SNOOP,
        ..DeviceInfo::default()
    });
    let sender = t.open_running("sender", 8, 0);
    let listener = t.open("listener", 8, SessionFlags::LISTEN_TX);
    listener.attach(PORT).expect("Failed to attach");
    listener.offer_rx(0..4);

    sender.send(4, PORT, &ethernet_frame(1, 64));
    assert!(t.driver.wait_tx(1, WAIT));
    assert!(listener.read_rx(SHORT).is_none());
}

#[test]
fn test_paused_listener_gets_nothing() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let sender = t.open_running("sender", 8, 0);
    let listener = t.open("listener", 8, SessionFlags::LISTEN_TX);
    listener.offer_rx(0..4);

    sender.send(4, PORT, &ethernet_frame(1, 64));
    assert!(t.driver.wait_tx(1, WAIT));
    assert!(listener.read_rx(SHORT).is_none());

    // Attached, it hears tx
    listener.attach(PORT).expect("Failed to attach");
    sender.send(5, PORT, &ethernet_frame(2, 64));
    let copy = listener.read_rx(WAIT).expect("No tx copy");
    assert_eq!(sequence(&copy.payload), Some(2));

    // Detached again, it stops
    listener.detach(PORT).expect("Failed to detach");
    sender.send(6, PORT, &ethernet_frame(3, 64));
    assert!(t.driver.wait_tx(3, WAIT));
    assert!(listener.read_rx(SHORT).is_none());
}

#[test]
fn test_primary_listener_does_not_hear_itself() {
    let _ = tracing_subscriber::fmt::try_init();
    let t = TestDevice::new();
    let both = SessionFlags {
        primary: true,
        listen_tx: true,
    };
    let a = t.open("a", 8, both);
    a.attach(PORT).expect("Failed to attach");
    let b = t.open("b", 8, SessionFlags::LISTEN_TX);
    b.attach(PORT).expect("Failed to attach");
    b.offer_rx(0..2);

    a.send(0, PORT, &ethernet_frame(5, 64));
    let copy = b.read_rx(WAIT).expect("No tx copy");
    assert_eq!(sequence(&copy.payload), Some(5));
    assert!(a.read_rx(SHORT).is_none());
}
