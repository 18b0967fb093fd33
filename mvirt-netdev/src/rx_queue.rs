//! Device-wide rx space pool and the rx worker.
//!
//! The worker keeps the driver supplied with rx space taken from the primary
//! session. It sleeps on a signal channel and, while there is room in the
//! pool, on the primary session's rx FIFO. The current primary is published
//! through an [`ArcSwapOption`] so the worker can rebuild its wait set
//! without touching the control lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use tracing::{debug, error, trace};

use crate::device::{RxBuffer, RxSpaceBuffer};
use crate::error::{Error, Result};
use crate::interface::{ControlState, DeviceInterface};
use crate::session::Session;

pub(crate) struct InFlightRx {
    pub(crate) session: Arc<Session>,
    pub(crate) descriptor: u16,
}

pub(crate) struct RxPool {
    slots: Vec<Option<InFlightRx>>,
    free: Vec<u32>,
    /// Minimum free slots before space is queued again.
    threshold: usize,
}

impl RxPool {
    fn new(depth: u16, threshold: u16) -> Self {
        Self {
            slots: (0..depth).map(|_| None).collect(),
            free: (0..u32::from(depth)).rev().collect(),
            threshold: usize::from(threshold).max(1),
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    fn take(&mut self, id: u32) -> Option<InFlightRx> {
        let entry = self.slots.get_mut(id as usize)?.take()?;
        self.free.push(id);
        Some(entry)
    }

    fn drain(&mut self) -> Vec<(u32, InFlightRx)> {
        let mut drained = Vec::new();
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.take() {
                self.free.push(id as u32);
                drained.push((id as u32, entry));
            }
        }
        drained
    }
}

/// Batch of rx space being collected for one `queue_rx_space` call.
pub(crate) struct RxTransaction<'a> {
    pool: &'a mut RxPool,
    buffers: Vec<RxSpaceBuffer>,
}

impl<'a> RxTransaction<'a> {
    fn new(pool: &'a mut RxPool) -> Self {
        Self {
            pool,
            buffers: Vec::new(),
        }
    }

    /// Free slots left in the pool.
    pub(crate) fn remaining(&self) -> usize {
        self.pool.free.len()
    }

    /// Reserve a slot for `descriptor` of `session`; `fill` describes the
    /// space given the slot id. The slot is released again if `fill` fails.
    pub(crate) fn push(
        &mut self,
        session: &Arc<Session>,
        descriptor: u16,
        fill: impl FnOnce(u32) -> Result<RxSpaceBuffer>,
    ) -> Result<()> {
        let id = self.pool.free.pop().ok_or(Error::NoResources)?;
        match fill(id) {
            Ok(space) => {
                self.pool.slots[id as usize] = Some(InFlightRx {
                    session: Arc::clone(session),
                    descriptor,
                });
                self.buffers.push(space);
                Ok(())
            }
            Err(e) => {
                self.pool.free.push(id);
                Err(e)
            }
        }
    }

    fn into_buffers(self) -> Vec<RxSpaceBuffer> {
        self.buffers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxSignal {
    /// Re-evaluate: space was freed, the data path opened or the primary
    /// changed.
    Watch,
    Quit,
}

pub(crate) struct RxQueue {
    pool: Mutex<RxPool>,
    primary: Arc<ArcSwapOption<Session>>,
    signal_tx: Sender<RxSignal>,
    signal_rx: Receiver<RxSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RxQueue {
    pub(crate) fn new(depth: u16, threshold: u16) -> Self {
        let (signal_tx, signal_rx) = crossbeam_channel::unbounded();
        Self {
            pool: Mutex::new(RxPool::new(depth, threshold)),
            primary: Arc::new(ArcSwapOption::empty()),
            signal_tx,
            signal_rx,
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RxPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the rx worker.
    pub(crate) fn start(&self, device: Weak<DeviceInterface>) -> Result<()> {
        let primary = Arc::clone(&self.primary);
        let signals = self.signal_rx.clone();
        let handle = thread::Builder::new()
            .name("netdev-rx".to_string())
            .spawn(move || rx_worker(device, primary, signals))
            .map_err(|e| {
                error!(error = %e, "Failed to spawn rx worker");
                Error::NoResources
            })?;
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Publish the session rx space is taken from.
    pub(crate) fn set_primary(&self, primary: Option<Arc<Session>>) {
        self.primary.store(primary);
        self.trigger_watch();
    }

    pub(crate) fn trigger_watch(&self) {
        let _ = self.signal_tx.send(RxSignal::Watch);
    }

    /// Queue rx space from the primary session. Returns whether the worker
    /// should keep watching the primary's rx FIFO.
    pub(crate) fn fill(&self, device: &DeviceInterface) -> bool {
        let mut pool = self.lock();
        let control = device.control_read();
        if !control.is_data_plane_open() {
            return false;
        }
        let available = pool.available();
        if available == 0 || available < pool.threshold {
            return false;
        }
        let mut transaction = RxTransaction::new(&mut pool);
        let result = control.load_rx_descriptors(&mut transaction);
        let buffers = transaction.into_buffers();
        drop(control);

        if !buffers.is_empty() {
            trace!(count = buffers.len(), "Queueing rx space");
            device.driver().queue_rx_space(buffers);
        }
        match result {
            Ok(()) | Err(Error::ShouldWait) => pool.available() > 0,
            Err(e) => {
                trace!(error = %e, "Rx space unavailable");
                false
            }
        }
    }

    /// Fan completed rx buffers out to their owner and every other
    /// interested session.
    pub(crate) fn complete(&self, device: &DeviceInterface, buffers: &[RxBuffer]) {
        let (reused, refill) = {
            let mut pool = self.lock();
            let control = device.control_read();
            let mut reused = 0usize;
            for buffer in buffers {
                let Some(entry) = pool.take(buffer.id) else {
                    error!(id = buffer.id, "Driver completed unknown rx buffer");
                    continue;
                };
                if buffer.length != 0 {
                    control.copy_session_data(&entry.session, entry.descriptor, buffer);
                }
                if entry.session.complete_rx(&control, entry.descriptor, buffer) {
                    reused += 1;
                }
            }
            control.commit_all_sessions();
            (reused, pool.available() >= pool.threshold)
        };
        if reused > 0 {
            trace!(reused, "Rx space returned for reuse");
        }
        if reused > 0 || refill {
            self.trigger_watch();
        }
        device.prune_dead_sessions();
    }

    /// Return every outstanding space buffer to its session unused. Used once
    /// the device has stopped.
    pub(crate) fn reclaim(pool: &mut RxPool, control: &ControlState) {
        let drained = pool.drain();
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "Reclaiming rx buffers");
        for (id, entry) in drained {
            entry
                .session
                .complete_rx(control, entry.descriptor, &RxBuffer::unused(id));
        }
    }
}

impl Drop for RxQueue {
    fn drop(&mut self) {
        let _ = self.signal_tx.send(RxSignal::Quit);
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

fn rx_worker(
    device: Weak<DeviceInterface>,
    primary: Arc<ArcSwapOption<Session>>,
    signals: Receiver<RxSignal>,
) {
    debug!("Rx worker started");
    let mut watch_fifo = false;
    loop {
        let current = primary.load_full();
        let signalled = {
            let mut select = Select::new();
            let signal_index = select.recv(&signals);
            if watch_fifo && let Some(session) = &current {
                select.recv(session.rx_fifo_receiver());
            }
            select.ready() == signal_index
        };
        drop(current);
        if signalled {
            match signals.try_recv() {
                Ok(RxSignal::Quit) | Err(TryRecvError::Disconnected) => break,
                Ok(RxSignal::Watch) | Err(TryRecvError::Empty) => {}
            }
        }

        let Some(device) = device.upgrade() else {
            break;
        };
        watch_fifo = device.rx_queue().fill(&device);
    }
    debug!("Rx worker stopped");
}
