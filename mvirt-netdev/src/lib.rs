pub mod binding;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod fifo;
pub mod interface;
pub mod port;
mod rx_queue;
pub mod session;
pub mod state;
pub mod test_util;
mod tx_queue;
pub mod vmo;
pub mod watcher;

pub use binding::DeviceBinding;
pub use error::{Error, Result};
pub use interface::{DeviceInterface, DeviceSnapshot};
pub use session::{Session, SessionFifos, SessionFlags, SessionHandle, SessionInfo};
