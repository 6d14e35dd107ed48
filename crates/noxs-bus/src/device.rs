use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use noxs_abi::{BusId, ControlPage, DeviceKey, XenbusState};
use tracing::{debug, error, info};

use crate::comm::{lock, CommChannel, CommHandle, NotificationEvent, WorkerGauge};
use crate::error::{NoxsError, Result};
use crate::hypervisor::Hypervisor;

/// Longest single sleep while polling the peer's half of the page.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Peer state as read from the control page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Valid(XenbusState),
    /// A value that does not decode to any state, or an unreadable header.
    Invalid(u32),
}

impl PeerState {
    pub fn from_raw(raw: u32) -> Self {
        match XenbusState::try_from(raw) {
            Ok(state) => PeerState::Valid(state),
            Err(_) => PeerState::Invalid(raw),
        }
    }

    pub fn state(self) -> Option<XenbusState> {
        match self {
            PeerState::Valid(state) => Some(state),
            PeerState::Invalid(_) => None,
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Valid(state) => write!(f, "{state}"),
            PeerState::Invalid(raw) => write!(f, "invalid({raw})"),
        }
    }
}

#[derive(Debug)]
struct Status {
    state: XenbusState,
    last_error: Option<NoxsError>,
}

/// Backend-side device instance shared by the registry, its worker and drivers.
#[derive(Debug)]
pub struct Device {
    key: DeviceKey,
    comm: CommChannel,
    status: Mutex<Status>,
    changed: Condvar,
    online: AtomicBool,
    inflight: AtomicUsize,
}

/// In-flight I/O reference; the device refuses to disconnect or be destroyed while any exist.
#[derive(Debug)]
pub struct IoRef {
    device: Arc<Device>,
}

impl Drop for IoRef {
    fn drop(&mut self) {
        self.device.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Device {
    /// Sets up the transport and publishes `Initialising`.
    pub(crate) fn initialize(
        hv: Arc<dyn Hypervisor>,
        key: DeviceKey,
        online: bool,
    ) -> Result<Arc<Self>> {
        let comm = CommChannel::initialize(hv, &key)?;
        comm.page().set_backend_state(XenbusState::Initialising)?;
        Ok(Arc::new(Self {
            key,
            comm,
            status: Mutex::new(Status {
                state: XenbusState::Initialising,
                last_error: None,
            }),
            changed: Condvar::new(),
            online: AtomicBool::new(online),
            inflight: AtomicUsize::new(0),
        }))
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn bus_id(&self) -> &BusId {
        self.comm.bus_id()
    }

    pub fn page(&self) -> &ControlPage {
        self.comm.page()
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        self.comm.hypervisor()
    }

    /// Frontend domain.
    pub fn otherend_id(&self) -> noxs_abi::DomId {
        self.comm.remote()
    }

    pub fn comm(&self) -> &CommChannel {
        &self.comm
    }

    pub fn handle(&self) -> Result<CommHandle> {
        self.comm.handle()
    }

    pub fn state(&self) -> XenbusState {
        lock(&self.status).state
    }

    /// Current peer state; a header that fails validation reads as invalid.
    pub fn peer_state(&self) -> PeerState {
        match self.page().frontend_state_raw() {
            Ok(raw) => PeerState::from_raw(raw),
            Err(err) => {
                debug!(bus_id = %self.bus_id(), error = %err, "control page header rejected");
                PeerState::Invalid(u32::MAX)
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<NoxsError> {
        lock(&self.status).last_error.clone()
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn begin_io(self: &Arc<Self>) -> IoRef {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        IoRef {
            device: self.clone(),
        }
    }

    fn publish(&self, state: XenbusState) -> Result<()> {
        self.page().set_backend_state(state)?;
        if let Err(err) = self.comm.notify() {
            debug!(bus_id = %self.bus_id(), error = %err, "state change notify failed");
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Moves the local state forward.
    ///
    /// Equal states are a no-op. Going backwards is refused except for the reconnect path
    /// `Closed -> Initialising | InitWait`.
    pub fn switch_state(&self, next: XenbusState) -> Result<()> {
        let mut status = lock(&self.status);
        let current = status.state;
        if current == next {
            return Ok(());
        }
        let restart = current == XenbusState::Closed
            && matches!(next, XenbusState::Initialising | XenbusState::InitWait);
        if next < current && !restart {
            return Err(NoxsError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        status.state = next;
        drop(status);
        debug!(bus_id = %self.bus_id(), from = %current, to = %next, "backend state");
        self.publish(next)
    }

    /// Resets to `Initialising` regardless of the current state (resume path).
    pub(crate) fn restart(&self) -> Result<()> {
        lock(&self.status).state = XenbusState::Initialising;
        self.publish(XenbusState::Initialising)
    }

    /// Forces `Closed` without the monotonic check.
    pub(crate) fn force_closed(&self) {
        let previous = std::mem::replace(&mut lock(&self.status).state, XenbusState::Closed);
        if previous != XenbusState::Closed {
            if let Err(err) = self.publish(XenbusState::Closed) {
                debug!(bus_id = %self.bus_id(), error = %err, "publishing Closed failed");
            }
        }
    }

    pub fn record_error(&self, err: NoxsError) {
        lock(&self.status).last_error = Some(err);
    }

    /// Records `err`, logs it and forces the device to `Closed`.
    pub fn fatal(&self, err: NoxsError) {
        error!(bus_id = %self.bus_id(), error = %err, "fatal device error");
        self.record_error(err);
        self.force_closed();
    }

    pub(crate) fn watch(
        &self,
        gauge: &WorkerGauge,
        callback: impl FnMut(NotificationEvent) + Send + 'static,
    ) -> Result<()> {
        self.comm.watch_otherend(gauge, callback)
    }

    /// Wakes waiters after a notification was handled.
    pub(crate) fn pulse(&self) {
        let _status = lock(&self.status);
        self.changed.notify_all();
    }

    fn wait_until(&self, timeout: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(POLL_SLICE);
            let status = lock(&self.status);
            let _ = self.changed.wait_timeout(status, slice);
        }
    }

    /// Waits until the local state equals `state`.
    pub fn wait_for_state(&self, state: XenbusState, timeout: Duration) -> bool {
        self.wait_until(timeout, |dev| dev.state() == state)
    }

    /// Waits until the frontend publishes `state`.
    pub fn wait_for_peer_state(&self, state: XenbusState, timeout: Duration) -> bool {
        self.wait_until(timeout, |dev| dev.peer_state() == PeerState::Valid(state))
    }

    /// Waits until either side has reached `Closed`.
    pub fn wait_for_close(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |dev| {
            dev.state() == XenbusState::Closed
                || dev.peer_state() == PeerState::Valid(XenbusState::Closed)
        })
    }

    pub(crate) fn teardown(&self) {
        self.comm.teardown();
        info!(bus_id = %self.bus_id(), "device released");
    }
}
