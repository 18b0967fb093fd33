//! Device interface: the coordinator between clients and the driver.
//!
//! All session, port and teardown bookkeeping lives in [`ControlState`]
//! behind a single `RwLock`. The data path adds two pool locks owned by the
//! queues. Lock order is tx pool, then rx pool, then control, then the
//! per-session leaf mutexes.
//!
//! Driver calls that may complete synchronously (`start`, `stop`,
//! `release_vmo`, port `set_active`/`removed`) are collected into
//! [`PendingActions`] while locks are held and issued after they are
//! released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, error, info, warn};

use crate::binding::{BindingState, DeviceBinding};
use crate::device::{
    DeviceIfc, DeviceInfo, DeviceOpCompleter, FEATURE_NO_AUTO_SNOOP, FrameType, NetworkDeviceImpl,
    NetworkPortImpl, PortStatus, RxBuffer, TxResult,
};
use crate::error::{Error, Result};
use crate::port::{AttachedPort, DevicePort, MAX_PORTS, Port};
use crate::rx_queue::{RxQueue, RxTransaction};
use crate::session::{BufferLimits, Session, SessionFifos, SessionHandle, SessionInfo};
use crate::state::{DeviceOp, DeviceStateMachine, DeviceStatus, TeardownState};
use crate::tx_queue::TxQueue;
use crate::vmo::VmoStore;
use crate::watcher::{MAX_QUEUED_PORT_EVENTS, PortEvent, PortWatcher, WatchQueue};

type TeardownCallback = Box<dyn FnOnce() + Send + Sync>;

/// Point-in-time view of the interface for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub primary: Option<String>,
    pub sessions: Vec<String>,
    pub dead_sessions: usize,
    pub ports: Vec<u8>,
    pub device_status: DeviceStatus,
    pub teardown: TeardownState,
}

/// State guarded by the control lock.
pub(crate) struct ControlState {
    primary: Option<Arc<Session>>,
    sessions: Vec<Arc<Session>>,
    dead_sessions: Vec<Arc<Session>>,
    ports: Vec<Option<DevicePort>>,
    port_generations: [u32; MAX_PORTS],
    vmo_store: VmoStore,
    device: DeviceStateMachine,
    /// Running primary-capable sessions; the device runs while non-zero.
    active_primary_sessions: usize,
    has_listen_sessions: bool,
    teardown: TeardownState,
    teardown_callback: Option<TeardownCallback>,
    bindings: Vec<Arc<BindingState>>,
    port_watchers: Vec<Arc<WatchQueue<PortEvent>>>,
}

impl ControlState {
    fn new() -> Self {
        Self {
            primary: None,
            sessions: Vec::new(),
            dead_sessions: Vec::new(),
            ports: (0..MAX_PORTS).map(|_| None).collect(),
            port_generations: [0; MAX_PORTS],
            vmo_store: VmoStore::new(),
            device: DeviceStateMachine::default(),
            active_primary_sessions: 0,
            has_listen_sessions: false,
            teardown: TeardownState::Running,
            teardown_callback: None,
            bindings: Vec::new(),
            port_watchers: Vec::new(),
        }
    }

    pub(crate) fn port(&self, id: u8) -> Option<&DevicePort> {
        self.ports.get(usize::from(id))?.as_ref()
    }

    fn port_mut(&mut self, id: u8) -> Option<&mut DevicePort> {
        self.ports.get_mut(usize::from(id))?.as_mut()
    }

    /// Generation of the live port `id`.
    pub(crate) fn port_generation(&self, id: u8) -> Option<u32> {
        self.port(id).map(|p| p.generation)
    }

    pub(crate) fn is_data_plane_open(&self) -> bool {
        self.device.is_open()
    }

    /// Primary first, then ordinary sessions in open order.
    fn all_sessions(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.primary.iter().chain(self.sessions.iter())
    }

    fn is_primary(&self, session: &Arc<Session>) -> bool {
        self.primary
            .as_ref()
            .is_some_and(|primary| Arc::ptr_eq(primary, session))
    }

    /// Take rx space from the primary session.
    pub(crate) fn load_rx_descriptors(&self, transaction: &mut RxTransaction<'_>) -> Result<()> {
        match &self.primary {
            Some(primary) => primary.load_rx_descriptors(transaction),
            None => Err(Error::BadState),
        }
    }

    /// Copy a frame received into `owner`'s buffer to every other session
    /// that wants it.
    pub(crate) fn copy_session_data(&self, owner: &Session, owner_index: u16, buffer: &RxBuffer) {
        for session in self.all_sessions() {
            if !std::ptr::eq(session.as_ref(), owner) {
                session.complete_rx_with(self, owner, owner_index, buffer);
            }
        }
    }

    /// Flush pending rx completions of every session.
    pub(crate) fn commit_all_sessions(&self) {
        for session in self.all_sessions() {
            session.commit_rx();
        }
    }

    fn update_listen_sessions(&mut self) {
        let has_listen_sessions = self
            .all_sessions()
            .any(|session| session.is_listen() && !session.is_paused());
        self.has_listen_sessions = has_listen_sessions;
    }

    /// Promote the best ordinary session if it outranks the current primary.
    /// Earlier sessions win ties. Returns whether the primary changed.
    fn elect_primary(&mut self) -> bool {
        let mut best: Option<usize> = None;
        for (i, candidate) in self.sessions.iter().enumerate() {
            let current = match best {
                Some(b) => Some(self.sessions[b].as_ref()),
                None => self.primary.as_deref(),
            };
            if candidate.should_take_over_primary(current) {
                best = Some(i);
            }
        }
        let Some(index) = best else {
            return false;
        };
        let promoted = self.sessions.remove(index);
        info!(session = %promoted.name(), "Session promoted to primary");
        if let Some(previous) = self.primary.replace(promoted) {
            self.sessions.push(previous);
        }
        true
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            primary: self.primary.as_ref().map(|s| s.name().to_string()),
            sessions: self.sessions.iter().map(|s| s.name().to_string()).collect(),
            dead_sessions: self.dead_sessions.len(),
            ports: self.ports.iter().flatten().map(|p| p.id).collect(),
            device_status: self.device.status(),
            teardown: self.teardown,
        }
    }
}

/// Driver and client calls to issue once locks are released.
#[derive(Default)]
struct PendingActions {
    device_op: Option<DeviceOp>,
    released_vmos: Vec<u8>,
    destroyed: Vec<Arc<Session>>,
    port_activity: Vec<(Arc<dyn NetworkPortImpl>, bool)>,
    removed_ports: Vec<Arc<dyn NetworkPortImpl>>,
    teardown_callback: Option<TeardownCallback>,
}

impl PendingActions {
    fn device_op(&mut self, op: Option<DeviceOp>) {
        if self.device_op.is_none() {
            self.device_op = op;
        }
    }
}

/// Network device multiplexer.
pub struct DeviceInterface {
    driver: Arc<dyn NetworkDeviceImpl>,
    info: DeviceInfo,
    control: RwLock<ControlState>,
    rx_queue: RxQueue,
    tx_queue: TxQueue,
    next_session_id: AtomicU64,
    next_binding_id: AtomicU64,
    weak_self: Weak<DeviceInterface>,
}

impl DeviceInterface {
    /// Create the interface on top of `driver` and initialize the driver.
    pub fn create(driver: Arc<dyn NetworkDeviceImpl>) -> Result<Arc<Self>> {
        let info = driver.info();
        info.validate()?;
        let device = Arc::new_cyclic(|weak| DeviceInterface {
            rx_queue: RxQueue::new(info.rx_depth, info.rx_threshold),
            tx_queue: TxQueue::new(info.tx_depth),
            driver: Arc::clone(&driver),
            info,
            control: RwLock::new(ControlState::new()),
            next_session_id: AtomicU64::new(1),
            next_binding_id: AtomicU64::new(1),
            weak_self: weak.clone(),
        });
        device.rx_queue.start(Arc::downgrade(&device))?;
        driver
            .init(DeviceIfc::new(Arc::downgrade(&device)))
            .inspect_err(|e| error!(error = %e, "Driver init failed"))?;
        info!(
            rx_depth = device.info.rx_depth,
            tx_depth = device.info.tx_depth,
            "Device interface created"
        );
        Ok(device)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn driver(&self) -> &dyn NetworkDeviceImpl {
        self.driver.as_ref()
    }

    pub(crate) fn rx_queue(&self) -> &RxQueue {
        &self.rx_queue
    }

    pub(crate) fn tx_queue(&self) -> &TxQueue {
        &self.tx_queue
    }

    pub(crate) fn control_read(&self) -> RwLockReadGuard<'_, ControlState> {
        self.control.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn control_write(&self) -> RwLockWriteGuard<'_, ControlState> {
        self.control.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_data_plane_open(&self) -> bool {
        self.control_read().is_data_plane_open()
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.control_read().device.status()
    }

    pub fn teardown_state(&self) -> TeardownState {
        self.control_read().teardown
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.control_read().snapshot()
    }

    fn run_actions(&self, actions: PendingActions) {
        let PendingActions {
            device_op,
            released_vmos,
            destroyed,
            port_activity,
            removed_ports,
            teardown_callback,
        } = actions;

        for (port, active) in port_activity {
            port.set_active(active);
        }
        for port in removed_ports {
            port.removed();
        }
        for id in released_vmos {
            self.driver.release_vmo(id);
        }
        for session in destroyed {
            session.close_channel(Error::Canceled);
        }
        if let Some(op) = device_op {
            debug!(?op, "Issuing device operation");
            let completer = DeviceOpCompleter::new(self.weak_self.clone(), op);
            match op {
                DeviceOp::Start => self.driver.start(completer),
                DeviceOp::Stop => self.driver.stop(completer),
            }
        }
        if let Some(callback) = teardown_callback {
            info!("Teardown finished");
            callback();
        }
    }

    // Control surface

    /// Open a control connection.
    pub fn bind(&self) -> Result<DeviceBinding> {
        let mut control = self.control_write();
        if control.teardown != TeardownState::Running {
            return Err(Error::Unavailable);
        }
        let state = Arc::new(BindingState::new(
            self.next_binding_id.fetch_add(1, Ordering::Relaxed),
        ));
        control.bindings.push(Arc::clone(&state));
        debug!(binding = state.id(), "Binding opened");
        Ok(DeviceBinding::new(self.weak_self.clone(), state))
    }

    pub(crate) fn unbind(&self, state: &Arc<BindingState>) {
        let mut actions = PendingActions::default();
        {
            let mut control = self.control_write();
            control.bindings.retain(|b| !Arc::ptr_eq(b, state));
            debug!(binding = state.id(), "Binding closed");
            self.continue_teardown(&mut control, TeardownState::Bindings, &mut actions);
        }
        self.run_actions(actions);
    }

    /// Open a session. The session starts paused; attach it to a port to
    /// start moving frames.
    pub fn open_session(
        &self,
        name: &str,
        info: SessionInfo,
    ) -> Result<(SessionHandle, SessionFifos)> {
        let mut control = self.control_write();
        if control.teardown != TeardownState::Running {
            warn!(session = %name, teardown = %control.teardown, "Open session during teardown");
            return Err(Error::Unavailable);
        }
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (session, handle, fifos) = Session::create(
            id,
            name,
            info,
            BufferLimits::from(&self.info),
            self.weak_self.clone(),
        )?;

        let vmo_id = control
            .vmo_store
            .register(session.data().clone())
            .inspect_err(|_| warn!(session = %name, "VMO store full"))?;
        if let Err(e) = self.driver.prepare_vmo(vmo_id, session.data().duplicate()) {
            error!(session = %name, vmo_id, error = %e, "Driver failed to prepare VMO");
            let _ = control.vmo_store.unregister(vmo_id);
            return Err(e);
        }
        session.set_vmo_id(vmo_id);
        if let Err(e) = session.start_worker() {
            let _ = control.vmo_store.unregister(vmo_id);
            drop(control);
            self.driver.release_vmo(vmo_id);
            return Err(e);
        }

        if session.should_take_over_primary(control.primary.as_deref()) {
            if let Some(previous) = control.primary.replace(Arc::clone(&session)) {
                control.sessions.push(previous);
            }
            self.rx_queue.set_primary(control.primary.clone());
        } else {
            control.sessions.push(Arc::clone(&session));
        }
        info!(
            session = %name,
            vmo_id,
            descriptors = session.descriptor_count(),
            primary = control.is_primary(&session),
            "Session opened"
        );
        Ok((handle, fifos))
    }

    /// Client handle to port `id`.
    pub fn get_port(&self, id: u8) -> Result<Port> {
        if usize::from(id) >= MAX_PORTS {
            return Err(Error::InvalidArgs);
        }
        let control = self.control_read();
        let generation = control.port_generation(id).ok_or(Error::NotFound)?;
        Ok(Port::new(self.weak_self.clone(), id, generation))
    }

    /// Watch ports being added and removed.
    pub fn port_watcher(&self) -> Result<PortWatcher> {
        let mut control = self.control_write();
        if control.teardown != TeardownState::Running {
            return Err(Error::Unavailable);
        }
        let queue = Arc::new(WatchQueue::new(MAX_QUEUED_PORT_EVENTS));
        for port in control.ports.iter().flatten() {
            queue.push(PortEvent::Existing(port.id));
        }
        queue.push(PortEvent::Idle);
        control.port_watchers.retain(|w| !w.is_closed());
        control.port_watchers.push(Arc::clone(&queue));
        Ok(PortWatcher::new(queue))
    }

    pub(crate) fn with_port<R>(
        &self,
        id: u8,
        generation: u32,
        f: impl FnOnce(&mut DevicePort) -> Result<R>,
    ) -> Result<R> {
        let mut control = self.control_write();
        let port = control
            .port_mut(id)
            .filter(|port| port.generation == generation)
            .ok_or(Error::PeerClosed)?;
        f(port)
    }

    /// Begin shutdown. `callback` runs once every binding, port and session
    /// is gone and the device is stopped.
    pub fn teardown(&self, callback: impl FnOnce() + Send + Sync + 'static) {
        let mut actions = PendingActions::default();
        {
            let mut control = self.control_write();
            if control.teardown != TeardownState::Running {
                warn!(teardown = %control.teardown, "Teardown already in progress");
                return;
            }
            info!("Teardown requested");
            control.teardown_callback = Some(Box::new(callback));
            self.continue_teardown(&mut control, TeardownState::Running, &mut actions);
        }
        self.run_actions(actions);
    }

    /// Advance teardown from `expected` as far as current state allows.
    /// A stale `expected` phase is a no-op.
    fn continue_teardown(
        &self,
        control: &mut ControlState,
        expected: TeardownState,
        actions: &mut PendingActions,
    ) {
        if control.teardown != expected {
            return;
        }
        loop {
            let next = match control.teardown {
                TeardownState::Running => {
                    for binding in control.bindings.drain(..) {
                        binding.close();
                    }
                    for watcher in control.port_watchers.drain(..) {
                        watcher.close(Error::Canceled);
                    }
                    TeardownState::Bindings
                }
                TeardownState::Bindings => {
                    if !control.bindings.is_empty() {
                        return;
                    }
                    for id in 0..MAX_PORTS as u8 {
                        self.teardown_port(control, id, actions);
                    }
                    TeardownState::Ports
                }
                TeardownState::Ports => {
                    if control.ports.iter().any(Option::is_some) {
                        return;
                    }
                    for session in control.all_sessions() {
                        session.kill();
                    }
                    TeardownState::Sessions
                }
                TeardownState::Sessions => {
                    if control.primary.is_some()
                        || !control.sessions.is_empty()
                        || !control.dead_sessions.is_empty()
                        || control.device.status() != DeviceStatus::Stopped
                    {
                        return;
                    }
                    actions.teardown_callback = control.teardown_callback.take();
                    TeardownState::Finished
                }
                TeardownState::Finished => {
                    panic!("teardown continued after it finished");
                }
            };
            info!(from = %control.teardown, to = %next, "Teardown progressing");
            control.teardown = next;
            if next == TeardownState::Finished {
                return;
            }
        }
    }

    // Ports

    pub(crate) fn add_port(&self, id: u8, port: Arc<dyn NetworkPortImpl>) {
        let mut actions = PendingActions::default();
        if usize::from(id) >= MAX_PORTS {
            error!(port_id = id, "Port id out of range");
            actions.removed_ports.push(port);
            self.run_actions(actions);
            return;
        }
        let info = port.info();
        let status = port.status();
        let mac = port.mac();
        {
            let mut control = self.control_write();
            if control.teardown != TeardownState::Running {
                warn!(port_id = id, teardown = %control.teardown, "Port added during teardown");
                actions.removed_ports.push(port);
            } else if control.port(id).is_some() {
                error!(port_id = id, "Port already exists");
                actions.removed_ports.push(port);
            } else {
                let slot = usize::from(id);
                control.port_generations[slot] = control.port_generations[slot].wrapping_add(1);
                let generation = control.port_generations[slot];
                control.ports[slot] = Some(DevicePort::new(id, generation, port, info, status, mac));
                control
                    .port_watchers
                    .retain(|w| w.push(PortEvent::Added(id)));
                info!(port_id = id, generation, "Port added");
            }
        }
        self.run_actions(actions);
    }

    pub(crate) fn remove_port(&self, id: u8) {
        let mut actions = PendingActions::default();
        {
            let mut control = self.control_write();
            if control.port(id).is_none() {
                warn!(port_id = id, "Removing unknown port");
                return;
            }
            self.teardown_port(&mut control, id, &mut actions);
            self.continue_teardown(&mut control, TeardownState::Ports, &mut actions);
        }
        self.run_actions(actions);
    }

    pub(crate) fn port_status_changed(&self, id: u8, status: PortStatus) {
        let mut control = self.control_write();
        match control.port_mut(id) {
            Some(port) => {
                debug!(port_id = id, mtu = status.mtu, online = status.online, "Port status changed");
                port.set_status(status);
            }
            None => warn!(port_id = id, "Status change for unknown port"),
        }
    }

    /// Detach every session from port `id` and clear its slot.
    fn teardown_port(&self, control: &mut ControlState, id: u8, actions: &mut PendingActions) {
        let Some(mut port) = control.ports[usize::from(id)].take() else {
            return;
        };
        let sessions: Vec<Arc<Session>> = control.all_sessions().cloned().collect();
        for session in sessions {
            if session.attached_generation(id) != Some(port.generation) {
                continue;
            }
            if let Ok((_, now_empty)) = session.remove_port(id) {
                debug!(session = %session.name(), port_id = id, "Port destroyed under session");
                if now_empty && !session.set_paused(true) {
                    self.session_stopped(control, &session, actions);
                }
            }
        }
        port.close_watchers();
        actions.removed_ports.push(port.port);
        control
            .port_watchers
            .retain(|w| w.push(PortEvent::Removed(id)));
        info!(port_id = id, "Port removed");
    }

    /// Validate an attachment request against the live port table.
    fn acquire_port(
        control: &ControlState,
        port_id: u8,
        frame_types: &[FrameType],
    ) -> Result<AttachedPort> {
        if usize::from(port_id) >= MAX_PORTS {
            return Err(Error::InvalidArgs);
        }
        control
            .port(port_id)
            .ok_or(Error::NotFound)?
            .attachment(frame_types)
    }

    fn release_port_attachment(
        control: &mut ControlState,
        port_id: u8,
        generation: u32,
        actions: &mut PendingActions,
    ) {
        if let Some(port) = control
            .port_mut(port_id)
            .filter(|port| port.generation == generation)
        {
            port.attached_sessions = port.attached_sessions.saturating_sub(1);
            if port.attached_sessions == 0 {
                actions.port_activity.push((Arc::clone(&port.port), false));
            }
        }
    }

    pub(crate) fn attach_session_port(
        &self,
        session: &Arc<Session>,
        port_id: u8,
        frame_types: &[FrameType],
    ) -> Result<()> {
        let mut actions = PendingActions::default();
        let result = {
            let mut control = self.control_write();
            self.attach_locked(&mut control, session, port_id, frame_types, &mut actions)
        };
        self.run_actions(actions);
        result
    }

    fn attach_locked(
        &self,
        control: &mut ControlState,
        session: &Arc<Session>,
        port_id: u8,
        frame_types: &[FrameType],
        actions: &mut PendingActions,
    ) -> Result<()> {
        if session.is_killed() || session.is_dying() {
            return Err(Error::BadState);
        }
        let attached = Self::acquire_port(control, port_id, frame_types)
            .inspect_err(|e| warn!(session = %session.name(), port_id, error = %e, "Attach rejected"))?;
        let first = session.insert_port(attached)?;
        if let Some(port) = control.port_mut(port_id) {
            port.attached_sessions += 1;
            if port.attached_sessions == 1 {
                actions.port_activity.push((Arc::clone(&port.port), true));
            }
        }
        info!(session = %session.name(), port_id, ?frame_types, "Session attached to port");
        if first && session.set_paused(false) {
            self.session_started(control, session, actions);
        }
        Ok(())
    }

    pub(crate) fn detach_session_port(&self, session: &Arc<Session>, port_id: u8) -> Result<bool> {
        let mut actions = PendingActions::default();
        let result = {
            let mut control = self.control_write();
            session.remove_port(port_id).map(|(attached, now_empty)| {
                Self::release_port_attachment(
                    &mut control,
                    port_id,
                    attached.generation(),
                    &mut actions,
                );
                info!(session = %session.name(), port_id, "Session detached from port");
                if now_empty && !session.set_paused(true) {
                    self.session_stopped(&mut control, session, &mut actions);
                }
                now_empty
            })
        };
        self.run_actions(actions);
        result
    }

    // Session lifecycle

    fn session_started(
        &self,
        control: &mut ControlState,
        session: &Arc<Session>,
        actions: &mut PendingActions,
    ) {
        debug!(session = %session.name(), "Session started");
        if session.is_primary() {
            control.active_primary_sessions += 1;
            actions.device_op(control.device.start());
        }
        if !control.is_primary(session)
            && session.should_take_over_primary(control.primary.as_deref())
        {
            control.sessions.retain(|s| !Arc::ptr_eq(s, session));
            info!(session = %session.name(), "Session took over primary");
            if let Some(previous) = control.primary.replace(Arc::clone(session)) {
                control.sessions.push(previous);
            }
            self.rx_queue.set_primary(control.primary.clone());
        }
        control.update_listen_sessions();
    }

    fn session_stopped(
        &self,
        control: &mut ControlState,
        session: &Arc<Session>,
        actions: &mut PendingActions,
    ) {
        debug!(session = %session.name(), "Session stopped");
        if session.is_primary() {
            control.active_primary_sessions = control.active_primary_sessions.saturating_sub(1);
            if control.active_primary_sessions == 0 {
                actions.device_op(control.device.stop());
            }
        }
        if control.is_primary(session) && control.elect_primary() {
            self.rx_queue.set_primary(control.primary.clone());
        }
        control.update_listen_sessions();
    }

    /// Called by a session's worker once it has been killed.
    pub(crate) fn notify_dead_session(&self, session: &Arc<Session>) {
        let mut actions = PendingActions::default();
        {
            let mut control = self.control_write();
            for attached in session.take_ports() {
                Self::release_port_attachment(
                    &mut control,
                    attached.port_id(),
                    attached.generation(),
                    &mut actions,
                );
            }
            if !session.set_paused(true) {
                self.session_stopped(&mut control, session, &mut actions);
            }
            session.mark_dying();

            if control.is_primary(session) {
                control.primary = None;
                control.elect_primary();
                self.rx_queue.set_primary(control.primary.clone());
            } else {
                control.sessions.retain(|s| !Arc::ptr_eq(s, session));
            }
            control.update_listen_sessions();

            if session.should_destroy() {
                Self::destroy_session(&mut control, Arc::clone(session), &mut actions);
            } else {
                let (rx, tx) = session.in_flight();
                info!(session = %session.name(), rx, tx, "Session dead, waiting for buffers");
                control.dead_sessions.push(Arc::clone(session));
            }
            self.continue_teardown(&mut control, TeardownState::Sessions, &mut actions);
        }
        self.run_actions(actions);
    }

    fn destroy_session(
        control: &mut ControlState,
        session: Arc<Session>,
        actions: &mut PendingActions,
    ) {
        if let Some(vmo_id) = session.take_vmo_id() {
            if let Err(e) = control.vmo_store.unregister(vmo_id) {
                panic!("session {} VMO {vmo_id} not registered: {e}", session.name());
            }
            actions.released_vmos.push(vmo_id);
        }
        info!(session = %session.name(), "Session destroyed");
        actions.destroyed.push(session);
    }

    fn prune_locked(control: &mut ControlState, actions: &mut PendingActions) {
        let dead = std::mem::take(&mut control.dead_sessions);
        for session in dead {
            if session.should_destroy() {
                Self::destroy_session(control, session, actions);
            } else {
                control.dead_sessions.push(session);
            }
        }
    }

    /// Destroy dead sessions whose buffers have all come back.
    pub(crate) fn prune_dead_sessions(&self) {
        if self.control_read().dead_sessions.is_empty() {
            return;
        }
        let mut actions = PendingActions::default();
        {
            let mut control = self.control_write();
            Self::prune_locked(&mut control, &mut actions);
            self.continue_teardown(&mut control, TeardownState::Sessions, &mut actions);
        }
        self.run_actions(actions);
    }

    // Data path

    /// Copy frames `owner` is transmitting to listen sessions attached to
    /// the destination port.
    pub(crate) fn listen_session_data(
        &self,
        control: &ControlState,
        owner: &Session,
        descriptors: &[u16],
    ) {
        if self.info.features & FEATURE_NO_AUTO_SNOOP != 0
            || !control.has_listen_sessions
            || descriptors.is_empty()
        {
            return;
        }
        let listeners: Vec<&Arc<Session>> = control
            .all_sessions()
            .filter(|s| s.is_listen() && !s.is_paused() && !std::ptr::eq(s.as_ref(), owner))
            .collect();
        let mut copied = vec![false; listeners.len()];
        for &index in descriptors {
            let Some(port_id) = owner.tx_port(index) else {
                continue;
            };
            let Some(live) = control.port_generation(port_id) else {
                continue;
            };
            for (listener, copied) in listeners.iter().zip(copied.iter_mut()) {
                if listener.attached_generation(port_id) == Some(live)
                    && listener.listen_from_tx(owner, index)
                {
                    *copied = true;
                }
            }
        }
        for (listener, copied) in listeners.iter().zip(copied) {
            if copied {
                listener.commit_rx();
            }
        }
    }

    /// Wake every session blocked on a full tx queue.
    pub(crate) fn resume_all_tx(&self) {
        let control = self.control_read();
        for session in control.all_sessions() {
            session.resume_tx();
        }
    }

    pub(crate) fn complete_rx(&self, buffers: &[RxBuffer]) {
        self.rx_queue.complete(self, buffers);
    }

    pub(crate) fn complete_tx(&self, results: &[TxResult]) {
        self.tx_queue.complete(self, results);
    }

    // Device state

    pub(crate) fn device_started(&self) {
        let mut actions = PendingActions::default();
        {
            let mut control = self.control_write();
            let op = control.device.started();
            actions.device_op(op);
            info!(status = ?control.device.status(), "Device started");
            if control.device.is_open() {
                for session in control.all_sessions() {
                    session.resume_tx();
                }
                self.rx_queue.trigger_watch();
            }
        }
        self.run_actions(actions);
    }

    pub(crate) fn device_stopped(&self) {
        let mut actions = PendingActions::default();
        {
            let mut tx = self.tx_queue.lock();
            let mut rx = self.rx_queue.lock();
            let mut control = self.control_write();
            let op = control.device.stopped();
            info!(status = ?control.device.status(), "Device stopped");
            TxQueue::reclaim(&mut tx);
            RxQueue::reclaim(&mut rx, &control);
            Self::prune_locked(&mut control, &mut actions);
            actions.device_op(op);
            self.continue_teardown(&mut control, TeardownState::Sessions, &mut actions);
        }
        self.run_actions(actions);
    }

    pub(crate) fn device_start_failed(&self) {
        let mut actions = PendingActions::default();
        {
            let mut control = self.control_write();
            control.device.start_failed();
            warn!("Device failed to start, leaving it stopped");
            self.continue_teardown(&mut control, TeardownState::Sessions, &mut actions);
        }
        self.run_actions(actions);
    }
}

impl Drop for DeviceInterface {
    fn drop(&mut self) {
        let control = self.control.get_mut().unwrap_or_else(PoisonError::into_inner);
        if control.teardown != TeardownState::Finished {
            warn!(teardown = %control.teardown, "Device interface dropped before teardown finished");
        }
        for session in control
            .primary
            .iter()
            .chain(control.sessions.iter())
            .chain(control.dead_sessions.iter())
        {
            session.kill();
        }
    }
}
