//! Bounded event queues for port and status watchers.
//!
//! A watcher that falls behind is closed with [`Error::Canceled`] instead of
//! silently losing events.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::device::PortStatus;
use crate::error::{Error, Result};

/// Maximum number of port events queued for one watcher.
pub const MAX_QUEUED_PORT_EVENTS: usize = 128;

/// Maximum buffer depth of a status watcher.
pub const MAX_STATUS_BUFFER: u32 = 50;

struct Producer<T> {
    sender: Option<Sender<T>>,
    closed: Option<Error>,
}

/// Bounded queue shared between the device (producer) and a watcher.
///
/// Closing drops the sender, so the watcher drains what is queued and then
/// sees the close reason.
pub(crate) struct WatchQueue<T> {
    producer: Mutex<Producer<T>>,
    receiver: Receiver<T>,
}

impl<T> WatchQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            producer: Mutex::new(Producer {
                sender: Some(sender),
                closed: None,
            }),
            receiver,
        }
    }

    fn producer(&self) -> MutexGuard<'_, Producer<T>> {
        self.producer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an event. Overflow closes the queue with `Canceled` and
    /// discards what was queued. Returns false if the queue is closed.
    pub(crate) fn push(&self, event: T) -> bool {
        let mut producer = self.producer();
        let Some(sender) = producer.sender.as_ref() else {
            return false;
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                producer.sender = None;
                producer.closed = Some(Error::Canceled);
                while self.receiver.try_recv().is_ok() {}
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                producer.sender = None;
                false
            }
        }
    }

    /// Close the queue. Events already queued are still delivered.
    pub(crate) fn close(&self, reason: Error) {
        let mut producer = self.producer();
        if producer.sender.take().is_some() {
            producer.closed = Some(reason);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.producer().sender.is_none()
    }

    /// Wait for the next event.
    pub(crate) fn pop(&self, timeout: Duration) -> Result<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Err(Error::TimedOut),
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.producer().closed.clone().unwrap_or(Error::Canceled))
            }
        }
    }
}

/// Port presence event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    /// Port present when the watcher was created.
    Existing(u8),
    /// End of the initial `Existing` burst.
    Idle,
    Added(u8),
    Removed(u8),
}

/// Stream of port presence events.
pub struct PortWatcher {
    queue: Arc<WatchQueue<PortEvent>>,
}

impl PortWatcher {
    pub(crate) fn new(queue: Arc<WatchQueue<PortEvent>>) -> Self {
        Self { queue }
    }

    /// Wait up to `timeout` for the next event.
    pub fn watch(&self, timeout: Duration) -> Result<PortEvent> {
        self.queue.pop(timeout)
    }
}

impl Drop for PortWatcher {
    fn drop(&mut self) {
        self.queue.close(Error::Canceled);
    }
}

/// Stream of status changes for one port.
pub struct StatusWatcher {
    queue: Arc<WatchQueue<PortStatus>>,
}

impl StatusWatcher {
    pub(crate) fn new(queue: Arc<WatchQueue<PortStatus>>) -> Self {
        Self { queue }
    }

    /// Wait up to `timeout` for the next status.
    pub fn watch_status(&self, timeout: Duration) -> Result<PortStatus> {
        self.queue.pop(timeout)
    }
}

impl std::fmt::Debug for StatusWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWatcher").finish_non_exhaustive()
    }
}

impl Drop for StatusWatcher {
    fn drop(&mut self) {
        self.queue.close(Error::Canceled);
    }
}
