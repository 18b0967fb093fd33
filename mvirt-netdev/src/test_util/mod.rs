//! Fake driver and port for tests and the demo binary.
//!
//! The fake device keeps every buffer it is handed in memory so callers can
//! inspect and complete them at their own pace.

pub mod fake_device;
pub mod fake_port;

pub use fake_device::{FakeEvent, FakeNetworkDevice};
pub use fake_port::FakeNetworkPort;
