//! Device run state and teardown phases.
//!
//! Driver start/stop calls are asynchronous, so the run state is a small
//! state machine with a remembered pending operation rather than a boolean.
//! Transitions are pure: each returns the driver call to issue (if any) and
//! the caller performs it once its locks are released.

use std::fmt;

/// Actual run state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Driver operation to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Start,
    Stop,
}

/// Run state plus the request that arrived while a transition was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStateMachine {
    status: DeviceStatus,
    pending: Option<DeviceOp>,
}

impl DeviceStateMachine {
    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn pending(&self) -> Option<DeviceOp> {
        self.pending
    }

    /// Request the data path to run.
    pub fn start(&mut self) -> Option<DeviceOp> {
        match self.status {
            DeviceStatus::Started | DeviceStatus::Starting => {
                self.pending = None;
                None
            }
            DeviceStatus::Stopping => {
                self.pending = Some(DeviceOp::Start);
                None
            }
            DeviceStatus::Stopped => {
                self.pending = None;
                self.status = DeviceStatus::Starting;
                Some(DeviceOp::Start)
            }
        }
    }

    /// Request the data path to stop.
    pub fn stop(&mut self) -> Option<DeviceOp> {
        match self.status {
            DeviceStatus::Stopped | DeviceStatus::Stopping => {
                self.pending = None;
                None
            }
            DeviceStatus::Starting => {
                self.pending = Some(DeviceOp::Stop);
                None
            }
            DeviceStatus::Started => {
                self.pending = None;
                self.status = DeviceStatus::Stopping;
                Some(DeviceOp::Stop)
            }
        }
    }

    /// The driver finished starting.
    pub fn started(&mut self) -> Option<DeviceOp> {
        self.status = DeviceStatus::Started;
        match self.pending.take() {
            Some(DeviceOp::Stop) => self.stop(),
            _ => None,
        }
    }

    /// The driver finished stopping.
    pub fn stopped(&mut self) -> Option<DeviceOp> {
        self.status = DeviceStatus::Stopped;
        match self.pending.take() {
            Some(DeviceOp::Start) => self.start(),
            _ => None,
        }
    }

    /// The driver failed to start. No retry is attempted.
    pub fn start_failed(&mut self) {
        self.status = DeviceStatus::Stopped;
        self.pending = None;
    }

    /// Data path is open for buffers.
    pub fn is_open(&self) -> bool {
        self.status == DeviceStatus::Started
    }
}

/// Progress of device-wide shutdown. Strictly monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TeardownState {
    #[default]
    Running,
    Bindings,
    Ports,
    Sessions,
    Finished,
}

impl fmt::Display for TeardownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownState::Running => "running",
            TeardownState::Bindings => "bindings",
            TeardownState::Ports => "ports",
            TeardownState::Sessions => "sessions",
            TeardownState::Finished => "finished",
        };
        f.write_str(name)
    }
}
