//! Client sessions.
//!
//! A session owns a descriptor ring shared with its client, the client's data
//! VMO, and two FIFOs of descriptor indices (rx and tx). Each session runs a
//! worker thread that waits on its tx FIFO and on kill/resume signals; it
//! never blocks while holding a device lock.
//!
//! Everything read from the descriptor ring is untrusted. Descriptors are
//! validated on every use and a malformed one kills the offending session
//! only.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Select, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::descriptor::{
    BufferDescriptor, DESCRIPTOR_SIZE, DESCRIPTOR_VERSION, DescriptorTable, INFO_TYPE_NO_INFO,
    MAX_DESCRIPTOR_CHAIN, rx_flags, tx_return,
};
use crate::device::{
    BufferRegion, DeviceInfo, FrameMeta, FrameType, MAX_FIFO_DEPTH, RxBuffer, RxSpaceBuffer,
    TxBuffer, TxStatus,
};
use crate::error::{Error, Result};
use crate::fifo::{FifoEnd, fifo_pair};
use crate::interface::{ControlState, DeviceInterface};
use crate::port::{AttachedPort, MAX_PORTS};
use crate::rx_queue::RxTransaction;
use crate::vmo::Vmo;

/// Maximum length of a session name in bytes.
pub const MAX_SESSION_NAME: usize = 64;

const NO_VMO: u16 = u16::MAX;

/// Session options chosen at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFlags {
    /// Session may become the primary rx consumer and keeps the device
    /// running while attached.
    pub primary: bool,
    /// Session receives copies of frames transmitted by other sessions.
    pub listen_tx: bool,
}

impl SessionFlags {
    pub const PRIMARY: Self = Self {
        primary: true,
        listen_tx: false,
    };
    pub const LISTEN_TX: Self = Self {
        primary: false,
        listen_tx: true,
    };
}

/// Parameters of a new session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub descriptor_version: u8,
    /// Size of one descriptor slot in 8-byte words.
    pub descriptor_length: u8,
    pub descriptor_count: u16,
    pub flags: SessionFlags,
    /// Client buffer memory, shared with the device.
    pub data: Vmo,
}

impl SessionInfo {
    /// Primary session with the default descriptor layout.
    pub fn new(data: Vmo, descriptor_count: u16) -> Self {
        Self {
            descriptor_version: DESCRIPTOR_VERSION,
            descriptor_length: (DESCRIPTOR_SIZE / 8) as u8,
            descriptor_count,
            flags: SessionFlags::PRIMARY,
            data,
        }
    }

    pub fn with_flags(mut self, flags: SessionFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Client ends of a session's FIFOs.
#[derive(Debug)]
pub struct SessionFifos {
    /// Client writes available rx descriptors, reads completed ones.
    pub rx: FifoEnd,
    /// Client writes tx descriptors, reads completed ones.
    pub tx: FifoEnd,
}

/// Buffer constraints copied from the device info.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferLimits {
    min_rx: u32,
    min_tx: u32,
    tx_head: u16,
    tx_tail: u16,
    alignment: u64,
    max_buffer_length: u32,
}

impl From<&DeviceInfo> for BufferLimits {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            min_rx: info.min_rx_buffer_length,
            min_tx: info.min_tx_buffer_length,
            tx_head: info.tx_head_length,
            tx_tail: info.tx_tail_length,
            alignment: u64::from(info.buffer_alignment.max(1)),
            max_buffer_length: info.max_buffer_length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionSignal {
    Kill,
    ResumeTx,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active = 0,
    Dying = 1,
    DestroyScheduled = 2,
}

#[derive(Default)]
struct RxState {
    /// Descriptors the client made available for receiving.
    avail: VecDeque<u16>,
    /// Filled descriptors waiting for the next commit.
    ret: Vec<u16>,
}

/// Outcome of validating one tx descriptor.
enum TxCheck {
    Ready(TxBuffer),
    /// Port not attached; the descriptor was handed back with an error.
    Returned,
}

/// Per-client session state.
pub struct Session {
    id: u64,
    name: String,
    flags: SessionFlags,
    descriptors: DescriptorTable,
    data: Vmo,
    vmo_id: AtomicU16,
    fifo_rx: FifoEnd,
    fifo_tx: FifoEnd,
    limits: BufferLimits,
    parent: Weak<DeviceInterface>,
    ports: Mutex<Vec<Option<AttachedPort>>>,
    rx: Mutex<RxState>,
    paused: AtomicBool,
    killed: AtomicBool,
    lifecycle: AtomicU8,
    in_flight_rx: AtomicUsize,
    in_flight_tx: AtomicUsize,
    signal_tx: Sender<SessionSignal>,
    signal_rx: Receiver<SessionSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
    epitaph: Mutex<Option<Sender<Error>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("paused", &self.is_paused())
            .field("killed", &self.is_killed())
            .field("in_flight_rx", &self.in_flight_rx.load(Ordering::SeqCst))
            .field("in_flight_tx", &self.in_flight_tx.load(Ordering::SeqCst))
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Validate `info` and allocate the session. The worker is not started.
    pub(crate) fn create(
        id: u64,
        name: &str,
        info: SessionInfo,
        limits: BufferLimits,
        parent: Weak<DeviceInterface>,
    ) -> Result<(Arc<Session>, SessionHandle, SessionFifos)> {
        if name.len() > MAX_SESSION_NAME {
            warn!(len = name.len(), "Session name too long");
            return Err(Error::InvalidArgs);
        }
        if info.descriptor_version != DESCRIPTOR_VERSION {
            warn!(
                session = %name,
                version = info.descriptor_version,
                "Unsupported descriptor version"
            );
            return Err(Error::NotSupported);
        }
        if info.descriptor_count == 0 || info.descriptor_count > MAX_FIFO_DEPTH {
            warn!(session = %name, count = info.descriptor_count, "Invalid descriptor count");
            return Err(Error::InvalidArgs);
        }
        let descriptors = DescriptorTable::allocate(info.descriptor_count, info.descriptor_length)?;
        let depth = usize::from(info.descriptor_count);
        let (fifo_rx, client_rx) = fifo_pair(depth);
        let (fifo_tx, client_tx) = fifo_pair(depth);
        let (signal_tx, signal_rx) = crossbeam_channel::unbounded();
        let (epitaph_tx, epitaph_rx) = crossbeam_channel::bounded(1);

        let session = Arc::new(Session {
            id,
            name: name.to_string(),
            flags: info.flags,
            descriptors: descriptors.clone(),
            data: info.data,
            vmo_id: AtomicU16::new(NO_VMO),
            fifo_rx,
            fifo_tx,
            limits,
            parent,
            ports: Mutex::new(vec![None; MAX_PORTS]),
            rx: Mutex::new(RxState::default()),
            paused: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            lifecycle: AtomicU8::new(Lifecycle::Active as u8),
            in_flight_rx: AtomicUsize::new(0),
            in_flight_tx: AtomicUsize::new(0),
            signal_tx,
            signal_rx,
            worker: Mutex::new(None),
            epitaph: Mutex::new(Some(epitaph_tx)),
        });
        let handle = SessionHandle {
            session: Arc::downgrade(&session),
            name: name.to_string(),
            descriptors,
            epitaph: epitaph_rx,
        };
        let fifos = SessionFifos {
            rx: client_rx,
            tx: client_tx,
        };
        Ok((session, handle, fifos))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session declared itself primary-capable.
    pub fn is_primary(&self) -> bool {
        self.flags.primary
    }

    pub fn is_listen(&self) -> bool {
        self.flags.listen_tx
    }

    /// No ports attached.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_dying(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) != Lifecycle::Active as u8
    }

    pub fn descriptor_count(&self) -> u16 {
        self.descriptors.count()
    }

    /// Buffers currently lent to the device, as `(rx, tx)`.
    pub fn in_flight(&self) -> (usize, usize) {
        (
            self.in_flight_rx.load(Ordering::SeqCst),
            self.in_flight_tx.load(Ordering::SeqCst),
        )
    }

    /// Id of the registered data VMO, `None` before registration and after
    /// release.
    pub fn vmo_id(&self) -> Option<u8> {
        u8::try_from(self.vmo_id.load(Ordering::SeqCst)).ok()
    }

    pub(crate) fn set_vmo_id(&self, id: u8) {
        self.vmo_id.store(u16::from(id), Ordering::SeqCst);
    }

    pub(crate) fn take_vmo_id(&self) -> Option<u8> {
        u8::try_from(self.vmo_id.swap(NO_VMO, Ordering::SeqCst)).ok()
    }

    pub(crate) fn data(&self) -> &Vmo {
        &self.data
    }

    /// Receiving side of the rx FIFO, for the rx worker's wait set.
    pub(crate) fn rx_fifo_receiver(&self) -> &Receiver<u16> {
        self.fifo_rx.receiver()
    }

    pub(crate) fn set_paused(&self, paused: bool) -> bool {
        self.paused.swap(paused, Ordering::SeqCst)
    }

    /// Whether this session should replace `current` as the primary.
    ///
    /// Running sessions beat paused ones; otherwise the session with more
    /// descriptors wins and ties keep the current primary.
    pub fn should_take_over_primary(&self, current: Option<&Session>) -> bool {
        if !self.is_primary() || self.is_killed() {
            return false;
        }
        let Some(current) = current else {
            return true;
        };
        if std::ptr::eq(current, self) {
            return false;
        }
        if current.is_paused() && !self.is_paused() {
            return true;
        }
        if !current.is_paused() && self.is_paused() {
            return false;
        }
        self.descriptor_count() > current.descriptor_count()
    }

    // Port attachments

    /// Attach to `port_id`, subscribing to `frame_types` on rx.
    pub fn attach_port(self: &Arc<Self>, port_id: u8, frame_types: &[FrameType]) -> Result<()> {
        let device = self.parent.upgrade().ok_or(Error::BadState)?;
        device.attach_session_port(self, port_id, frame_types)
    }

    /// Detach from `port_id`. Returns true if the session is now paused.
    pub fn detach_port(self: &Arc<Self>, port_id: u8) -> Result<bool> {
        let device = self.parent.upgrade().ok_or(Error::BadState)?;
        device.detach_session_port(self, port_id)
    }

    /// Current attachments.
    pub fn attached_ports(&self) -> Vec<AttachedPort> {
        lock(&self.ports).iter().flatten().cloned().collect()
    }

    pub(crate) fn attached_generation(&self, port_id: u8) -> Option<u32> {
        lock(&self.ports)
            .get(usize::from(port_id))
            .and_then(Option::as_ref)
            .map(AttachedPort::generation)
    }

    /// Record an attachment. Returns true if it is the first one.
    pub(crate) fn insert_port(&self, attached: AttachedPort) -> Result<bool> {
        let mut ports = lock(&self.ports);
        let was_empty = ports.iter().all(Option::is_none);
        let slot = ports
            .get_mut(usize::from(attached.port_id()))
            .ok_or(Error::InvalidArgs)?;
        if slot.is_some() {
            return Err(Error::AlreadyExists);
        }
        *slot = Some(attached);
        Ok(was_empty)
    }

    /// Drop an attachment. Returns it and whether none remain.
    pub(crate) fn remove_port(&self, port_id: u8) -> Result<(AttachedPort, bool)> {
        let mut ports = lock(&self.ports);
        let attached = ports
            .get_mut(usize::from(port_id))
            .ok_or(Error::InvalidArgs)?
            .take()
            .ok_or(Error::NotFound)?;
        Ok((attached, ports.iter().all(Option::is_none)))
    }

    /// Drop every attachment.
    pub(crate) fn take_ports(&self) -> Vec<AttachedPort> {
        lock(&self.ports).iter_mut().filter_map(Option::take).collect()
    }

    /// Whether frames of `frame_type` arriving on `port_id` are wanted.
    pub(crate) fn is_subscribed(&self, control: &ControlState, port_id: u8, frame_type: u8) -> bool {
        let Some(live) = control.port_generation(port_id) else {
            return false;
        };
        lock(&self.ports)
            .get(usize::from(port_id))
            .and_then(Option::as_ref)
            .is_some_and(|attached| attached.generation() == live && attached.accepts(frame_type))
    }

    // Lifecycle

    pub(crate) fn start_worker(self: &Arc<Self>) -> Result<()> {
        let session = Arc::clone(self);
        let signals = self.signal_rx.clone();
        let handle = thread::Builder::new()
            .name(format!("netdev-session-{}", self.id))
            .spawn(move || session.run(signals))
            .map_err(|e| {
                error!(session = %self.name, error = %e, "Failed to spawn session worker");
                Error::NoResources
            })?;
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    /// Begin tearing the session down. Idempotent; only the first call has
    /// any effect.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = %self.name, "Killing session");
        let _ = self.signal_tx.send(SessionSignal::Kill);
    }

    /// Tell the worker the tx queue has room again.
    pub(crate) fn resume_tx(&self) {
        let _ = self.signal_tx.send(SessionSignal::ResumeTx);
    }

    pub(crate) fn mark_dying(&self) {
        let _ = self.lifecycle.compare_exchange(
            Lifecycle::Active as u8,
            Lifecycle::Dying as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// True exactly once: when the session is dying, holds no device buffers
    /// and destruction has not been scheduled yet.
    pub fn should_destroy(&self) -> bool {
        if self.in_flight_rx.load(Ordering::SeqCst) != 0
            || self.in_flight_tx.load(Ordering::SeqCst) != 0
        {
            return false;
        }
        self.lifecycle
            .compare_exchange(
                Lifecycle::Dying as u8,
                Lifecycle::DestroyScheduled as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Close the client's control channel with `reason`.
    pub(crate) fn close_channel(&self, reason: Error) {
        if let Some(epitaph) = lock(&self.epitaph).take() {
            let _ = epitaph.send(reason);
        }
    }

    pub(crate) fn rx_taken(&self) {
        self.in_flight_rx.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn rx_returned(&self) {
        let prev = self.in_flight_rx.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "rx buffer returned to session {} with none in flight", self.name);
    }

    pub(crate) fn tx_taken(&self) {
        self.in_flight_tx.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn tx_returned(&self, count: usize) {
        let prev = self.in_flight_tx.fetch_sub(count, Ordering::SeqCst);
        assert!(prev >= count, "tx buffers returned to session {} beyond in flight", self.name);
    }

    fn run(self: Arc<Self>, signals: Receiver<SessionSignal>) {
        debug!(session = %self.name, "Session worker started");
        let mut tx_blocked = false;
        loop {
            let watch_tx = !tx_blocked
                && self
                    .parent
                    .upgrade()
                    .is_some_and(|device| device.is_data_plane_open());

            let mut select = Select::new();
            let signal_index = select.recv(&signals);
            if watch_tx {
                select.recv(self.fifo_tx.receiver());
            }
            if select.ready() == signal_index {
                match signals.try_recv() {
                    Ok(SessionSignal::Kill) | Err(TryRecvError::Disconnected) => break,
                    Ok(SessionSignal::ResumeTx) => tx_blocked = false,
                    Err(TryRecvError::Empty) => {}
                }
                continue;
            }

            let Some(device) = self.parent.upgrade() else {
                break;
            };
            match self.fetch_tx(&device) {
                Ok(()) | Err(Error::ShouldWait) => {}
                Err(Error::IoOverrun) | Err(Error::Unavailable) => tx_blocked = true,
                Err(Error::PeerClosed) => {
                    debug!(session = %self.name, "Tx FIFO closed");
                    self.kill();
                }
                Err(e) => {
                    error!(session = %self.name, error = %e, "Tx fetch failed");
                    self.kill();
                }
            }
        }
        debug!(session = %self.name, "Session worker stopping");
        if let Some(device) = self.parent.upgrade() {
            device.notify_dead_session(&self);
        }
    }

    // Rx path

    /// Check a descriptor offered as rx space and return it.
    fn rx_target(&self, index: u16) -> Result<BufferDescriptor> {
        let desc = self.descriptors.get(index).ok_or_else(|| {
            error!(session = %self.name, index, "Rx descriptor out of range");
            Error::InvalidArgs
        })?;
        if desc.chain_length != 0 {
            error!(session = %self.name, index, chain_length = desc.chain_length, "Chained rx space");
            return Err(Error::InvalidArgs);
        }
        if desc.data_length < self.limits.min_rx {
            error!(
                session = %self.name,
                index,
                length = desc.data_length,
                min = self.limits.min_rx,
                "Rx buffer too small"
            );
            return Err(Error::InvalidArgs);
        }
        if desc.data_offset() % self.limits.alignment != 0 {
            error!(session = %self.name, index, offset = desc.data_offset(), "Misaligned rx buffer");
            return Err(Error::InvalidArgs);
        }
        if !self.data.contains(desc.offset, desc.buffer_length()) {
            error!(session = %self.name, index, offset = desc.offset, "Rx buffer outside data VMO");
            return Err(Error::InvalidArgs);
        }
        Ok(desc)
    }

    /// Describe descriptor `index` as rx space for the device.
    pub fn fill_rx_space(&self, index: u16, id: u32) -> Result<RxSpaceBuffer> {
        let desc = self.rx_target(index)?;
        let mut length = desc.data_length;
        if self.limits.max_buffer_length != 0 {
            length = length.min(self.limits.max_buffer_length);
        }
        Ok(RxSpaceBuffer {
            id,
            vmo_id: self.vmo_id().ok_or(Error::BadState)?,
            region: BufferRegion {
                offset: desc.data_offset(),
                length: u64::from(length),
            },
        })
    }

    /// Pull available descriptors from the client into the cache.
    fn fetch_rx_descriptors(&self, rx: &mut RxState) -> Result<()> {
        let mut buf = vec![0u16; usize::from(self.descriptor_count())];
        let read = self.fifo_rx.read(&mut buf)?;
        rx.avail.extend(&buf[..read]);
        Ok(())
    }

    /// Next available rx descriptor, fetching from the FIFO when the cache is
    /// empty. A closed FIFO kills the session.
    fn take_avail(&self, rx: &mut RxState) -> Option<u16> {
        if rx.avail.is_empty() {
            match self.fetch_rx_descriptors(rx) {
                Ok(()) => {}
                Err(Error::PeerClosed) => {
                    self.kill();
                    return None;
                }
                Err(_) => return None,
            }
        }
        rx.avail.pop_front()
    }

    /// Hand available descriptors to `transaction` as device rx space.
    pub(crate) fn load_rx_descriptors(
        self: &Arc<Self>,
        transaction: &mut RxTransaction<'_>,
    ) -> Result<()> {
        let mut rx = lock(&self.rx);
        if rx.avail.is_empty() {
            if let Err(e) = self.fetch_rx_descriptors(&mut rx) {
                if e == Error::PeerClosed {
                    self.kill();
                }
                return Err(e);
            }
        }
        while transaction.remaining() > 0 {
            let Some(index) = rx.avail.pop_front() else {
                break;
            };
            if let Err(e) = transaction.push(self, index, |id| self.fill_rx_space(index, id)) {
                self.kill();
                return Err(e);
            }
            self.rx_taken();
        }
        Ok(())
    }

    /// Write frame metadata for a completed rx buffer into descriptor `index`.
    fn load_rx_info(&self, index: u16, buffer: &RxBuffer) -> Result<()> {
        let mut desc = self.descriptors.get(index).ok_or(Error::InvalidArgs)?;
        if desc.chain_length != 0 {
            return Err(Error::InvalidArgs);
        }
        if buffer.length > desc.data_length {
            return Err(Error::NoResources);
        }
        if buffer.meta.info_type != INFO_TYPE_NO_INFO {
            warn!(session = %self.name, info_type = buffer.meta.info_type, "Info type not recognized");
        }
        desc.info_type = INFO_TYPE_NO_INFO;
        desc.frame_type = buffer.meta.frame_type;
        desc.port_id = buffer.meta.port;
        desc.inbound_flags = buffer.meta.flags;
        desc.return_flags = 0;
        desc.data_length = buffer.length;
        self.descriptors.set(index, &desc)
    }

    /// Complete rx space `index` that this session lent to the device.
    ///
    /// Returns true when the descriptor went back to the available pool
    /// without being shown to the client, so it can be offered to the device
    /// again.
    pub(crate) fn complete_rx(&self, control: &ControlState, index: u16, buffer: &RxBuffer) -> bool {
        let mut delivered = false;
        if buffer.length != 0
            && !self.is_paused()
            && self.is_subscribed(control, buffer.meta.port, buffer.meta.frame_type)
        {
            match self.load_rx_info(index, buffer) {
                Ok(()) => delivered = true,
                Err(e) => {
                    warn!(session = %self.name, index, error = %e, "Dropping rx frame");
                }
            }
        }

        let reused = {
            let mut rx = lock(&self.rx);
            if delivered {
                rx.ret.push(index);
                false
            } else if !self.is_killed() {
                rx.avail.push_front(index);
                true
            } else {
                false
            }
        };
        self.rx_returned();
        reused
    }

    /// Copy a frame received into `owner`'s buffer into one of ours.
    pub(crate) fn complete_rx_with(
        &self,
        control: &ControlState,
        owner: &Session,
        owner_index: u16,
        buffer: &RxBuffer,
    ) {
        if self.is_paused() || !self.is_subscribed(control, buffer.meta.port, buffer.meta.frame_type)
        {
            return;
        }
        let Some(owner_desc) = owner.descriptors.get(owner_index) else {
            return;
        };

        let mut rx = lock(&self.rx);
        let Some(target) = self.take_avail(&mut rx) else {
            trace!(session = %self.name, "No rx space for copied frame");
            return;
        };
        let desc = match self.rx_target(target) {
            Ok(desc) => desc,
            Err(_) => {
                self.kill();
                return;
            }
        };
        if buffer.length > desc.data_length {
            rx.avail.push_front(target);
            return;
        }
        let copied = self.data.copy_from(
            desc.data_offset(),
            &owner.data,
            owner_desc.data_offset(),
            buffer.length as usize,
        );
        if let Err(e) = copied.and_then(|()| self.load_rx_info(target, buffer)) {
            warn!(session = %self.name, from = %owner.name, error = %e, "Failed to copy rx frame");
            rx.avail.push_front(target);
            return;
        }
        rx.ret.push(target);
    }

    /// Destination port of tx descriptor `index`.
    pub(crate) fn tx_port(&self, index: u16) -> Option<u8> {
        self.descriptors.get(index).map(|desc| desc.port_id)
    }

    /// Payload regions of a tx chain in this session's data VMO.
    fn tx_payload(&self, head: u16) -> Option<(BufferDescriptor, Vec<(u64, u32)>)> {
        let first = self.descriptors.get(head)?;
        let mut parts = Vec::with_capacity(usize::from(first.chain_length) + 1);
        let mut desc = first;
        loop {
            parts.push((desc.data_offset(), desc.data_length));
            if desc.chain_length == 0 || parts.len() >= usize::from(MAX_DESCRIPTOR_CHAIN) {
                break;
            }
            desc = self.descriptors.get(desc.nxt)?;
        }
        Some((first, parts))
    }

    /// Copy a frame `owner` is transmitting into one of our rx buffers.
    /// Returns whether a copy was made.
    pub(crate) fn listen_from_tx(&self, owner: &Session, owner_index: u16) -> bool {
        if self.is_paused() {
            return false;
        }
        let Some((owner_desc, parts)) = owner.tx_payload(owner_index) else {
            return false;
        };
        let total: u64 = parts.iter().map(|(_, len)| u64::from(*len)).sum();

        let mut rx = lock(&self.rx);
        let Some(target) = self.take_avail(&mut rx) else {
            trace!(session = %self.name, "No rx space for tx listen");
            return false;
        };
        let mut desc = match self.rx_target(target) {
            Ok(desc) => desc,
            Err(_) => {
                self.kill();
                return false;
            }
        };
        if total > u64::from(desc.data_length) {
            trace!(session = %self.name, total, "Tx frame does not fit listen buffer");
            rx.avail.push_front(target);
            return false;
        }

        let mut written = 0u64;
        for (offset, len) in parts {
            if let Err(e) =
                self.data
                    .copy_from(desc.data_offset() + written, &owner.data, offset, len as usize)
            {
                warn!(session = %self.name, from = %owner.name, error = %e, "Failed to copy tx frame");
                rx.avail.push_front(target);
                return false;
            }
            written += u64::from(len);
        }

        desc.info_type = INFO_TYPE_NO_INFO;
        desc.frame_type = owner_desc.frame_type;
        desc.port_id = owner_desc.port_id;
        desc.inbound_flags = rx_flags::RX_ECHOED_TX;
        desc.return_flags = 0;
        desc.data_length = written as u32;
        if self.descriptors.set(target, &desc).is_err() {
            rx.avail.push_front(target);
            return false;
        }
        rx.ret.push(target);
        true
    }

    /// Flush completed rx descriptors to the client.
    pub fn commit_rx(&self) {
        let mut rx = lock(&self.rx);
        if rx.ret.is_empty() || self.is_paused() {
            return;
        }
        match self.fifo_rx.write(&rx.ret) {
            Ok(written) if written < rx.ret.len() => {
                warn!(
                    session = %self.name,
                    dropped = rx.ret.len() - written,
                    "Rx FIFO full, dropping completions"
                );
            }
            Ok(_) => {}
            Err(Error::PeerClosed) => debug!(session = %self.name, "Rx FIFO closed"),
            Err(e) => warn!(session = %self.name, error = %e, "Failed to commit rx"),
        }
        rx.ret.clear();
    }

    // Tx path

    /// Validate tx descriptor `index` and build the device buffer for it.
    fn build_tx_buffer(&self, control: &ControlState, index: u16) -> Result<TxCheck> {
        let desc = self.descriptors.get(index).ok_or_else(|| {
            error!(session = %self.name, index, "Tx descriptor out of range");
            Error::InvalidArgs
        })?;
        if usize::from(desc.port_id) >= MAX_PORTS {
            error!(session = %self.name, port_id = desc.port_id, "Invalid tx port id");
            return Err(Error::InvalidArgs);
        }
        let port = match (self.attached_generation(desc.port_id), control.port(desc.port_id)) {
            (Some(generation), Some(port)) if port.generation == generation => port,
            _ => {
                self.return_unattached_tx(index, desc)?;
                return Ok(TxCheck::Returned);
            }
        };
        if !port.supports_tx(desc.frame_type) {
            error!(
                session = %self.name,
                port_id = desc.port_id,
                frame_type = desc.frame_type,
                "Invalid tx frame type"
            );
            return Err(Error::InvalidArgs);
        }
        let limits = &self.limits;
        if desc.head_length < limits.tx_head {
            error!(session = %self.name, head_length = desc.head_length, "Insufficient tx head length");
            return Err(Error::InvalidArgs);
        }
        if desc.tail_length < limits.tx_tail {
            error!(session = %self.name, tail_length = desc.tail_length, "Insufficient tx tail length");
            return Err(Error::InvalidArgs);
        }
        if desc.chain_length >= MAX_DESCRIPTOR_CHAIN {
            error!(session = %self.name, chain_length = desc.chain_length, "Invalid tx chain length");
            return Err(Error::InvalidArgs);
        }
        if desc.info_type != INFO_TYPE_NO_INFO {
            warn!(session = %self.name, info_type = desc.info_type, "Discarding unrecognized info type");
        }

        let mut parts = Vec::with_capacity(usize::from(desc.chain_length) + 1);
        let mut total = 0u64;
        let mut cur = desc;
        let mut expect = desc.chain_length;
        loop {
            let mut region = if parts.is_empty() {
                BufferRegion {
                    offset: cur.offset + u64::from(cur.head_length - limits.tx_head),
                    length: u64::from(cur.data_length) + u64::from(limits.tx_head),
                }
            } else {
                BufferRegion {
                    offset: cur.data_offset(),
                    length: u64::from(cur.data_length),
                }
            };
            if expect == 0 {
                region.length += u64::from(limits.tx_tail);
            }
            if !self.data.contains(region.offset, region.length) {
                error!(session = %self.name, index, offset = region.offset, "Tx buffer outside data VMO");
                return Err(Error::InvalidArgs);
            }
            total += u64::from(cur.data_length);
            parts.push(region);
            if expect == 0 {
                break;
            }
            let next = self.descriptors.get(cur.nxt).ok_or_else(|| {
                error!(session = %self.name, nxt = cur.nxt, "Invalid chained descriptor index");
                Error::InvalidArgs
            })?;
            if next.chain_length != expect - 1 {
                error!(
                    session = %self.name,
                    nxt = cur.nxt,
                    chain_length = next.chain_length,
                    "Invalid next chain length"
                );
                return Err(Error::InvalidArgs);
            }
            cur = next;
            expect -= 1;
        }
        if total < u64::from(limits.min_tx) {
            error!(session = %self.name, total, min = limits.min_tx, "Tx buffer too small");
            return Err(Error::InvalidArgs);
        }

        Ok(TxCheck::Ready(TxBuffer {
            id: 0,
            vmo_id: self.vmo_id().ok_or(Error::BadState)?,
            meta: FrameMeta {
                port: desc.port_id,
                frame_type: desc.frame_type,
                info_type: INFO_TYPE_NO_INFO,
                flags: desc.inbound_flags,
            },
            head_length: limits.tx_head,
            tail_length: limits.tx_tail,
            parts,
        }))
    }

    /// Hand a tx descriptor for an unattached port straight back.
    fn return_unattached_tx(&self, index: u16, mut desc: BufferDescriptor) -> Result<()> {
        debug!(session = %self.name, port_id = desc.port_id, "Tx on unattached port");
        desc.return_flags = tx_return::TX_RET_ERROR | tx_return::TX_RET_NOT_AVAILABLE;
        self.descriptors.set(index, &desc)?;
        match self.fifo_tx.write_one(index) {
            Ok(()) => Ok(()),
            Err(Error::PeerClosed) => Err(Error::PeerClosed),
            Err(e) => {
                error!(session = %self.name, error = %e, "Failed to return tx descriptor");
                Err(Error::InvalidArgs)
            }
        }
    }

    /// Pull ready tx descriptors from the client and queue them to the device.
    pub(crate) fn fetch_tx(self: &Arc<Self>, device: &DeviceInterface) -> Result<()> {
        let mut pool = device.tx_queue().lock();
        if !device.is_data_plane_open() {
            return Err(Error::Unavailable);
        }
        let available = pool.available();
        if available == 0 {
            pool.set_overrun();
            return Err(Error::IoOverrun);
        }
        let mut fetched = vec![0u16; available.min(usize::from(self.descriptor_count()))];
        let count = self.fifo_tx.read(&mut fetched)?;
        fetched.truncate(count);

        let control = device.control_read();
        let mut buffers = Vec::with_capacity(count);
        let mut sent = Vec::with_capacity(count);
        let mut outcome = Ok(());
        for index in fetched {
            match self.build_tx_buffer(&control, index) {
                Ok(TxCheck::Ready(mut buffer)) => {
                    let Some(id) = pool.push(Arc::clone(self), index) else {
                        outcome = Err(Error::IoOverrun);
                        break;
                    };
                    buffer.id = id;
                    self.tx_taken();
                    buffers.push(buffer);
                    sent.push(index);
                }
                Ok(TxCheck::Returned) => {}
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        device.listen_session_data(&control, self, &sent);
        drop(control);

        if !buffers.is_empty() {
            trace!(session = %self.name, count = buffers.len(), "Queueing tx");
            device.driver().queue_tx(buffers);
        }
        outcome
    }

    /// Set the return flags of tx descriptor `index` from a device status.
    pub fn mark_tx_return_result(&self, index: u16, status: TxStatus) {
        let Some(mut desc) = self.descriptors.get(index) else {
            return;
        };
        desc.return_flags = match status {
            TxStatus::Ok => 0,
            TxStatus::NotSupported => tx_return::TX_RET_ERROR | tx_return::TX_RET_NOT_SUPPORTED,
            TxStatus::NoResources => tx_return::TX_RET_ERROR | tx_return::TX_RET_OUT_OF_RESOURCES,
            TxStatus::Unavailable => tx_return::TX_RET_ERROR | tx_return::TX_RET_NOT_AVAILABLE,
            TxStatus::Failed => tx_return::TX_RET_ERROR,
        };
        let _ = self.descriptors.set(index, &desc);
    }

    /// Hand completed tx descriptors back to the client.
    pub fn return_tx_descriptors(&self, indices: &[u16]) {
        match self.fifo_tx.write(indices) {
            Ok(written) if written < indices.len() => {
                warn!(
                    session = %self.name,
                    dropped = indices.len() - written,
                    "Tx FIFO full, dropping completions"
                );
            }
            Ok(_) => {}
            Err(Error::PeerClosed) => debug!(session = %self.name, "Tx FIFO closed"),
            Err(e) => warn!(session = %self.name, error = %e, "Failed to return tx descriptors"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let (rx, tx) = self.in_flight();
        if rx != 0 || tx != 0 {
            warn!(session = %self.name, rx, tx, "Session dropped with buffers in flight");
        }
        self.close_channel(Error::Canceled);
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

/// Client handle to an open session.
///
/// Dropping the handle closes the session.
pub struct SessionHandle {
    session: Weak<Session>,
    name: String,
    descriptors: DescriptorTable,
    epitaph: Receiver<Error>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("name", &self.name)
            .finish()
    }
}

impl SessionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor ring shared with the session.
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session
            .upgrade()
            .filter(|session| !session.is_killed())
            .ok_or(Error::Canceled)
    }

    /// Attach to a port, receiving `frame_types` from it.
    pub fn attach(&self, port_id: u8, frame_types: &[FrameType]) -> Result<()> {
        self.session()?.attach_port(port_id, frame_types)
    }

    /// Detach from a port.
    pub fn detach(&self, port_id: u8) -> Result<()> {
        self.session()?.detach_port(port_id).map(|_| ())
    }

    /// Close the session. It is destroyed once the device has returned every
    /// buffer it holds.
    pub fn close(&self) {
        if let Some(session) = self.session.upgrade() {
            session.kill();
        }
    }

    /// Wait for the control channel to close, returning the epitaph.
    pub fn wait_closed(&self, timeout: Duration) -> Result<Error> {
        match self.epitaph.recv_timeout(timeout) {
            Ok(reason) => Ok(reason),
            Err(RecvTimeoutError::Disconnected) => Ok(Error::Canceled),
            Err(RecvTimeoutError::Timeout) => Err(Error::TimedOut),
        }
    }

    /// Whether the control channel has closed.
    pub fn is_closed(&self) -> bool {
        self.wait_closed(Duration::ZERO).is_ok()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(name: &str, count: u16, flags: SessionFlags) -> Arc<Session> {
        let data = Vmo::create(usize::from(count) * 2048).unwrap();
        let info = SessionInfo::new(data, count).with_flags(flags);
        let limits = BufferLimits::from(&DeviceInfo::default());
        let (session, handle, _fifos) = Session::create(1, name, info, limits, Weak::new()).unwrap();
        std::mem::forget(handle);
        session
    }

    #[test]
    fn test_create_validation() {
        let limits = BufferLimits::from(&DeviceInfo::default());
        let data = Vmo::create(4096).unwrap();

        let mut info = SessionInfo::new(data.clone(), 4);
        info.descriptor_version = 2;
        assert_eq!(
            Session::create(1, "a", info, limits, Weak::new()).unwrap_err(),
            Error::NotSupported
        );

        let info = SessionInfo::new(data.clone(), 0);
        assert_eq!(
            Session::create(1, "a", info, limits, Weak::new()).unwrap_err(),
            Error::InvalidArgs
        );

        let mut info = SessionInfo::new(data.clone(), 4);
        info.descriptor_length = 2;
        assert_eq!(
            Session::create(1, "a", info, limits, Weak::new()).unwrap_err(),
            Error::InvalidArgs
        );

        let long_name = "x".repeat(MAX_SESSION_NAME + 1);
        assert_eq!(
            Session::create(1, &long_name, SessionInfo::new(data, 4), limits, Weak::new())
                .unwrap_err(),
            Error::InvalidArgs
        );
    }

    #[test]
    fn test_take_over_primary() {
        let a = session("a", 16, SessionFlags::PRIMARY);
        let b = session("b", 16, SessionFlags::PRIMARY);
        let big = session("big", 32, SessionFlags::PRIMARY);
        let listen = session("listen", 64, SessionFlags::LISTEN_TX);

        // Anyone primary-capable takes an empty slot
        assert!(a.should_take_over_primary(None));
        assert!(!listen.should_take_over_primary(None));
        // Never over ourselves
        assert!(!a.should_take_over_primary(Some(&a)));
        // Ties keep the current primary
        assert!(!b.should_take_over_primary(Some(&a)));
        // More descriptors win between equally paused sessions
        assert!(big.should_take_over_primary(Some(&a)));

        // A running session beats a paused one regardless of size
        b.set_paused(false);
        assert!(b.should_take_over_primary(Some(&big)));
        assert!(!big.should_take_over_primary(Some(&b)));

        // Killed sessions never take over
        a.kill();
        assert!(!a.should_take_over_primary(None));
    }

    #[test]
    fn test_should_destroy_exactly_once() {
        let s = session("a", 4, SessionFlags::PRIMARY);
        // Not dying yet
        assert!(!s.should_destroy());
        s.rx_taken();
        s.mark_dying();
        assert!(!s.should_destroy());
        s.rx_returned();
        assert!(s.should_destroy());
        assert!(!s.should_destroy());
    }

    #[test]
    fn test_kill_is_idempotent() {
        let s = session("a", 4, SessionFlags::PRIMARY);
        s.kill();
        s.kill();
        assert!(s.is_killed());
        let kills = s
            .signal_rx
            .try_iter()
            .filter(|sig| *sig == SessionSignal::Kill)
            .count();
        assert_eq!(kills, 1);
    }

    #[test]
    fn test_port_records() {
        let s = session("a", 4, SessionFlags::PRIMARY);
        let first = AttachedPort::new(3, 1, vec![FrameType::Ethernet]);
        assert!(s.insert_port(first.clone()).unwrap());
        assert_eq!(s.insert_port(first).unwrap_err(), Error::AlreadyExists);
        assert!(!s.insert_port(AttachedPort::new(4, 1, vec![])).unwrap());
        assert_eq!(s.attached_generation(3), Some(1));

        let (_, empty) = s.remove_port(3).unwrap();
        assert!(!empty);
        assert_eq!(s.remove_port(3).unwrap_err(), Error::NotFound);
        assert_eq!(s.remove_port(200).unwrap_err(), Error::InvalidArgs);
        let (_, empty) = s.remove_port(4).unwrap();
        assert!(empty);
    }

    #[test]
    fn test_fill_rx_space_rejects_chains() {
        let s = session("a", 4, SessionFlags::PRIMARY);
        s.set_vmo_id(2);
        s.descriptors.set(0, &BufferDescriptor::new(0, 2048)).unwrap();
        let space = s.fill_rx_space(0, 9).unwrap();
        assert_eq!(space.id, 9);
        assert_eq!(space.vmo_id, 2);
        assert_eq!(space.region, BufferRegion { offset: 0, length: 2048 });

        let mut chained = BufferDescriptor::new(2048, 1024);
        chained.chain_length = 1;
        chained.nxt = 2;
        s.descriptors.set(1, &chained).unwrap();
        assert_eq!(s.fill_rx_space(1, 10).unwrap_err(), Error::InvalidArgs);

        // Outside the data VMO
        s.descriptors
            .set(2, &BufferDescriptor::new(4 * 2048, 64))
            .unwrap();
        assert_eq!(s.fill_rx_space(2, 11).unwrap_err(), Error::InvalidArgs);
    }

    #[test]
    fn test_mark_tx_return_result() {
        let s = session("a", 4, SessionFlags::PRIMARY);
        let cases = [
            (TxStatus::Ok, 0),
            (
                TxStatus::NotSupported,
                tx_return::TX_RET_ERROR | tx_return::TX_RET_NOT_SUPPORTED,
            ),
            (
                TxStatus::NoResources,
                tx_return::TX_RET_ERROR | tx_return::TX_RET_OUT_OF_RESOURCES,
            ),
            (
                TxStatus::Unavailable,
                tx_return::TX_RET_ERROR | tx_return::TX_RET_NOT_AVAILABLE,
            ),
            (TxStatus::Failed, tx_return::TX_RET_ERROR),
        ];
        for (status, flags) in cases {
            s.mark_tx_return_result(0, status);
            assert_eq!(s.descriptors.get(0).unwrap().return_flags, flags);
        }
    }
}
