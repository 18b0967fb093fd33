//! Device-wide tx buffer pool.
//!
//! Every tx buffer handed to the driver occupies one slot; the slot index is
//! the buffer id the driver reports back. Slots remember the owning session
//! and descriptor so completions can be routed back in order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::device::{TxResult, TxStatus};
use crate::interface::DeviceInterface;
use crate::session::Session;

pub(crate) struct InFlightTx {
    pub(crate) session: Arc<Session>,
    pub(crate) descriptor: u16,
}

pub(crate) struct TxPool {
    slots: Vec<Option<InFlightTx>>,
    free: Vec<u32>,
    /// A session found the pool full and is waiting for a resume.
    overrun: bool,
}

impl TxPool {
    fn new(depth: u16) -> Self {
        Self {
            slots: (0..depth).map(|_| None).collect(),
            free: (0..u32::from(depth)).rev().collect(),
            overrun: false,
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn set_overrun(&mut self) {
        self.overrun = true;
    }

    /// Reserve a slot. Returns its id, `None` when the pool is full.
    pub(crate) fn push(&mut self, session: Arc<Session>, descriptor: u16) -> Option<u32> {
        let id = self.free.pop()?;
        self.slots[id as usize] = Some(InFlightTx {
            session,
            descriptor,
        });
        Some(id)
    }

    /// Release slot `id`.
    pub(crate) fn take(&mut self, id: u32) -> Option<InFlightTx> {
        let entry = self.slots.get_mut(id as usize)?.take()?;
        self.free.push(id);
        Some(entry)
    }

    /// Release every occupied slot.
    pub(crate) fn drain(&mut self) -> Vec<(u32, InFlightTx)> {
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

/// Return completed descriptors to their sessions, preserving order.
fn return_completions(completed: Vec<(u32, InFlightTx, TxStatus)>) {
    let mut batches: Vec<(Arc<Session>, Vec<u16>)> = Vec::new();
    let mut index: HashMap<u64, usize> = HashMap::new();
    for (_, entry, status) in completed {
        entry.session.mark_tx_return_result(entry.descriptor, status);
        let slot = *index.entry(entry.session.id()).or_insert_with(|| {
            batches.push((Arc::clone(&entry.session), Vec::new()));
            batches.len() - 1
        });
        batches[slot].1.push(entry.descriptor);
    }
    for (session, descriptors) in batches {
        session.return_tx_descriptors(&descriptors);
        session.tx_returned(descriptors.len());
    }
}

pub(crate) struct TxQueue {
    pool: Mutex<TxPool>,
}

impl TxQueue {
    pub(crate) fn new(depth: u16) -> Self {
        Self {
            pool: Mutex::new(TxPool::new(depth)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TxPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route driver tx completions back to their sessions.
    pub(crate) fn complete(&self, device: &DeviceInterface, results: &[TxResult]) {
        let resume = {
            let mut pool = self.lock();
            let mut completed = Vec::with_capacity(results.len());
            for result in results {
                match pool.take(result.id) {
                    Some(entry) => completed.push((result.id, entry, result.status)),
                    None => error!(id = result.id, "Driver completed unknown tx buffer"),
                }
            }
            return_completions(completed);
            std::mem::take(&mut pool.overrun)
        };
        if resume {
            device.resume_all_tx();
        }
        device.prune_dead_sessions();
    }

    /// Hand every outstanding buffer back as unavailable. Used once the
    /// device has stopped. Called with the pool already locked.
    pub(crate) fn reclaim(pool: &mut TxPool) {
        let drained = pool.drain();
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "Reclaiming tx buffers");
        let completed = drained
            .into_iter()
            .map(|(id, entry)| (id, entry, TxStatus::Unavailable))
            .collect();
        return_completions(completed);
        pool.overrun = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_ids_are_recycled() {
        let mut pool = TxPool::new(2);
        assert_eq!(pool.available(), 2);
        assert!(pool.take(0).is_none());
        assert!(pool.take(9).is_none());
        assert!(pool.drain().is_empty());
        assert_eq!(pool.available(), 2);
    }
}
