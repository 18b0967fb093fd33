//! In-memory network device driver.
//!
//! Buffers queued by the multiplexer are held until the test (or the demo
//! binary) completes them. Start and stop complete immediately unless
//! automatic completion is switched off, in which case `trigger_start` and
//! `trigger_stop` finish them by hand.
//!
//! The fake never calls back into the multiplexer while holding its own
//! lock, since the multiplexer calls `queue_tx`/`queue_rx_space` with its
//! locks held.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::device::{
    DeviceIfc, DeviceInfo, DeviceOpCompleter, FrameMeta, NetworkDeviceImpl, RxBuffer,
    RxSpaceBuffer, TxBuffer, TxResult, TxStatus,
};
use crate::error::{Error, Result};
use crate::vmo::Vmo;

use super::FakeNetworkPort;

/// Driver call observed by the fake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeEvent {
    Start,
    Stop,
    Tx(usize),
    RxSpace(usize),
    VmoPrepared(u8),
    VmoReleased(u8),
}

#[derive(Default)]
struct FakeState {
    ifc: Option<DeviceIfc>,
    auto_start: bool,
    auto_stop: bool,
    fail_prepare: bool,
    pending_start: Option<DeviceOpCompleter>,
    pending_stop: Option<DeviceOpCompleter>,
    rx_space: VecDeque<RxSpaceBuffer>,
    tx: VecDeque<TxBuffer>,
    vmos: HashMap<u8, Vmo>,
}

pub struct FakeNetworkDevice {
    info: DeviceInfo,
    state: Mutex<FakeState>,
    events_tx: Sender<FakeEvent>,
    events_rx: Receiver<FakeEvent>,
}

impl FakeNetworkDevice {
    pub fn new() -> Arc<Self> {
        Self::with_info(DeviceInfo::default())
    }

    pub fn with_info(info: DeviceInfo) -> Arc<Self> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            info,
            state: Mutex::new(FakeState {
                auto_start: true,
                auto_stop: true,
                ..FakeState::default()
            }),
            events_tx,
            events_rx,
        })
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn event(&self, event: FakeEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Callback handle passed to `init`.
    pub fn ifc(&self) -> Option<DeviceIfc> {
        self.state().ifc.clone()
    }

    pub fn set_auto_start(&self, auto: bool) {
        self.state().auto_start = auto;
    }

    pub fn set_auto_stop(&self, auto: bool) {
        self.state().auto_stop = auto;
    }

    /// Make `prepare_vmo` fail.
    pub fn set_fail_prepare(&self, fail: bool) {
        self.state().fail_prepare = fail;
    }

    /// Complete a pending start. Returns false if none was pending.
    pub fn trigger_start(&self) -> bool {
        let pending = self.state().pending_start.take();
        match pending {
            Some(completer) => {
                completer.complete();
                true
            }
            None => false,
        }
    }

    /// Fail a pending start.
    pub fn fail_start(&self) -> bool {
        let pending = self.state().pending_start.take();
        match pending {
            Some(completer) => {
                completer.fail(Error::BadState);
                true
            }
            None => false,
        }
    }

    /// Complete a pending stop, dropping every buffer the fake holds.
    pub fn trigger_stop(&self) -> bool {
        let pending = {
            let mut state = self.state();
            let pending = state.pending_stop.take();
            if pending.is_some() {
                state.rx_space.clear();
                state.tx.clear();
            }
            pending
        };
        match pending {
            Some(completer) => {
                completer.complete();
                true
            }
            None => false,
        }
    }

    pub fn has_pending_start(&self) -> bool {
        self.state().pending_start.is_some()
    }

    pub fn has_pending_stop(&self) -> bool {
        self.state().pending_stop.is_some()
    }

    pub fn add_port(&self, id: u8, port: Arc<FakeNetworkPort>) {
        if let Some(ifc) = self.ifc() {
            ifc.add_port(id, port);
        }
    }

    pub fn remove_port(&self, id: u8) {
        if let Some(ifc) = self.ifc() {
            ifc.remove_port(id);
        }
    }

    /// Next driver call, waiting up to `timeout`.
    pub fn wait_event(&self, timeout: Duration) -> Option<FakeEvent> {
        self.events_rx.recv_timeout(timeout).ok()
    }

    /// Wait for an event matching `pred`, discarding others.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&FakeEvent) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.events_rx.recv_timeout(deadline - now) {
                Ok(event) if pred(&event) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    }

    /// Wait until at least `count` rx space buffers are held.
    pub fn wait_rx_space(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.rx_space_available() < count {
            if Instant::now() >= deadline {
                return false;
            }
            let _ = self.events_rx.recv_timeout(Duration::from_millis(10));
        }
        true
    }

    /// Wait until at least `count` tx buffers are held.
    pub fn wait_tx(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.tx_pending() < count {
            if Instant::now() >= deadline {
                return false;
            }
            let _ = self.events_rx.recv_timeout(Duration::from_millis(10));
        }
        true
    }

    pub fn rx_space_available(&self) -> usize {
        self.state().rx_space.len()
    }

    pub fn tx_pending(&self) -> usize {
        self.state().tx.len()
    }

    pub fn vmo_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.state().vmos.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Take every queued tx buffer without completing it.
    pub fn take_tx(&self) -> Vec<TxBuffer> {
        self.state().tx.drain(..).collect()
    }

    /// Payload of a tx buffer with device head and tail space stripped.
    pub fn read_tx(&self, buffer: &TxBuffer) -> Option<Vec<u8>> {
        let vmo = self.state().vmos.get(&buffer.vmo_id)?.clone();
        let mut payload = Vec::new();
        let last = buffer.parts.len().checked_sub(1)?;
        for (i, part) in buffer.parts.iter().enumerate() {
            let mut offset = part.offset;
            let mut length = part.length;
            if i == 0 {
                offset += u64::from(buffer.head_length);
                length = length.checked_sub(u64::from(buffer.head_length))?;
            }
            if i == last {
                length = length.checked_sub(u64::from(buffer.tail_length))?;
            }
            payload.extend(vmo.read_vec(offset, length as usize).ok()?);
        }
        Some(payload)
    }

    pub fn complete_tx(&self, results: &[TxResult]) {
        if let Some(ifc) = self.ifc() {
            ifc.complete_tx(results);
        }
    }

    /// Complete every queued tx buffer with `status`.
    pub fn return_tx(&self, status: TxStatus) -> usize {
        let results: Vec<TxResult> = self
            .take_tx()
            .iter()
            .map(|buffer| TxResult {
                id: buffer.id,
                status,
            })
            .collect();
        self.complete_tx(&results);
        results.len()
    }

    /// Deliver a frame into the oldest rx space buffer.
    pub fn receive(&self, meta: FrameMeta, data: &[u8]) -> bool {
        let (ifc, completed) = {
            let mut state = self.state();
            let Some(space) = state.rx_space.pop_front() else {
                return false;
            };
            let Some(vmo) = state.vmos.get(&space.vmo_id).cloned() else {
                return false;
            };
            if data.len() as u64 > space.region.length
                || vmo.write(space.region.offset, data).is_err()
            {
                state.rx_space.push_front(space);
                return false;
            }
            let completed = RxBuffer {
                id: space.id,
                meta,
                length: data.len() as u32,
            };
            (state.ifc.clone(), completed)
        };
        if let Some(ifc) = ifc {
            ifc.complete_rx(&[completed]);
        }
        true
    }

    /// Hand every rx space buffer back unused.
    pub fn return_rx_unused(&self) -> usize {
        let (ifc, returned) = {
            let mut state = self.state();
            let returned: Vec<RxBuffer> = state
                .rx_space
                .drain(..)
                .map(|space| RxBuffer::unused(space.id))
                .collect();
            (state.ifc.clone(), returned)
        };
        if let Some(ifc) = ifc {
            ifc.complete_rx(&returned);
        }
        returned.len()
    }

    /// Deliver every queued tx frame back as an rx frame on the same port.
    /// Frames without matching rx space are dropped. Returns the number of
    /// frames received.
    pub fn loop_back(&self) -> usize {
        let frames: Vec<(TxBuffer, Option<Vec<u8>>)> = self
            .take_tx()
            .into_iter()
            .map(|buffer| {
                let payload = self.read_tx(&buffer);
                (buffer, payload)
            })
            .collect();
        let mut received = 0;
        let mut results = Vec::with_capacity(frames.len());
        for (buffer, payload) in frames {
            let meta = FrameMeta {
                port: buffer.meta.port,
                frame_type: buffer.meta.frame_type,
                ..FrameMeta::default()
            };
            if let Some(payload) = payload
                && self.receive(meta, &payload)
            {
                received += 1;
            }
            results.push(TxResult {
                id: buffer.id,
                status: TxStatus::Ok,
            });
        }
        self.complete_tx(&results);
        debug!(frames = results.len(), received, "Looped back tx frames");
        received
    }
}

impl NetworkDeviceImpl for FakeNetworkDevice {
    fn init(&self, ifc: DeviceIfc) -> Result<()> {
        self.state().ifc = Some(ifc);
        Ok(())
    }

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn start(&self, completer: DeviceOpCompleter) {
        self.event(FakeEvent::Start);
        let auto = {
            let mut state = self.state();
            if state.auto_start {
                Some(completer)
            } else {
                state.pending_start = Some(completer);
                None
            }
        };
        if let Some(completer) = auto {
            completer.complete();
        }
    }

    fn stop(&self, completer: DeviceOpCompleter) {
        self.event(FakeEvent::Stop);
        let auto = {
            let mut state = self.state();
            if state.auto_stop {
                state.rx_space.clear();
                state.tx.clear();
                Some(completer)
            } else {
                state.pending_stop = Some(completer);
                None
            }
        };
        if let Some(completer) = auto {
            completer.complete();
        }
    }

    fn queue_tx(&self, buffers: Vec<TxBuffer>) {
        let count = buffers.len();
        self.state().tx.extend(buffers);
        self.event(FakeEvent::Tx(count));
    }

    fn queue_rx_space(&self, buffers: Vec<RxSpaceBuffer>) {
        let count = buffers.len();
        self.state().rx_space.extend(buffers);
        self.event(FakeEvent::RxSpace(count));
    }

    fn prepare_vmo(&self, id: u8, vmo: Vmo) -> Result<()> {
        let mut state = self.state();
        if state.fail_prepare {
            return Err(Error::NoResources);
        }
        state.vmos.insert(id, vmo);
        drop(state);
        self.event(FakeEvent::VmoPrepared(id));
        Ok(())
    }

    fn release_vmo(&self, id: u8) {
        self.state().vmos.remove(&id);
        self.event(FakeEvent::VmoReleased(id));
    }
}
