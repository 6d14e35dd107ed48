//! Control-page transport.
//!
//! A [`CommChannel`] owns the three resources that back one device instance: the control page,
//! the grant exposing it to the frontend, and an unbound event channel the frontend binds to.
//! Notifications arriving on that channel are handed to a dedicated worker thread per device
//! ([`NotifyWorker`]); the interrupt side only bumps a counter under a lock and wakes it.
//!
//! Setup order is page → grant → event channel; every failure unwinds what was already
//! allocated in reverse. Teardown closes the event channel, then revokes the grant, which also
//! releases the page.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use noxs_abi::{BusId, ControlPage, DeviceId, DeviceKey, DomId, EvtchnPort, GrantRef, WatchState};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{NoxsError, Result};
use crate::hypervisor::{Hypervisor, Irq};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the frontend needs to attach to a freshly created device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommHandle {
    pub device_id: DeviceId,
    pub grant: GrantRef,
    pub event_channel: EvtchnPort,
}

/// One firing of the remote event channel.
///
/// Carries no payload: consumers re-read the control page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Per-device arrival sequence number, starting at 0.
    pub seq: u64,
}

/// Per-device notification callback.
pub type WatchCallback = Box<dyn FnMut(NotificationEvent) + Send>;

/// Counts live notification workers.
#[derive(Debug, Clone, Default)]
pub struct WorkerGauge {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl WorkerGauge {
    pub fn active(&self) -> usize {
        *lock(&self.inner.0)
    }

    /// Blocks until no worker is alive or `timeout` elapses; returns whether it drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = lock(&self.inner.0);
        while *live > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            live = self
                .inner
                .1
                .wait_timeout(live, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn enter(&self) -> GaugeGuard {
        *lock(&self.inner.0) += 1;
        GaugeGuard(self.inner.clone())
    }
}

struct GaugeGuard(Arc<(Mutex<usize>, Condvar)>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        let mut live = lock(&self.0 .0);
        *live = live.saturating_sub(1);
        self.0 .1.notify_all();
    }
}

#[derive(Debug, Default)]
struct EventQueue {
    pending: u64,
    next_seq: u64,
    stopping: bool,
}

#[derive(Debug, Default)]
struct WorkerShared {
    queue: Mutex<EventQueue>,
    wake: Condvar,
}

impl WorkerShared {
    /// Interrupt-side producer; never blocks beyond the queue lock.
    fn raise(&self) {
        let mut queue = lock(&self.queue);
        if queue.stopping {
            return;
        }
        queue.pending += 1;
        drop(queue);
        self.wake.notify_one();
    }

    fn request_stop(&self) {
        lock(&self.queue).stopping = true;
        self.wake.notify_all();
    }

    fn stopping(&self) -> bool {
        lock(&self.queue).stopping
    }

    fn run(&self, callback: &Mutex<WatchCallback>) {
        loop {
            let (first, count) = {
                let mut queue = lock(&self.queue);
                while queue.pending == 0 && !queue.stopping {
                    queue = self
                        .wake
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if queue.stopping {
                    return;
                }
                let first = queue.next_seq;
                let count = queue.pending;
                queue.next_seq += count;
                queue.pending = 0;
                (first, count)
            };

            for seq in first..first + count {
                if self.stopping() {
                    return;
                }
                let mut cb = lock(callback);
                (*cb)(NotificationEvent { seq });
            }
        }
    }
}

/// Dedicated delivery thread for one device.
pub(crate) struct NotifyWorker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl NotifyWorker {
    pub(crate) fn spawn(name: String, gauge: &WorkerGauge, callback: WatchCallback) -> Result<Self> {
        let shared = Arc::new(WorkerShared::default());
        let worker_shared = shared.clone();
        let guard = gauge.enter();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = guard;
                let callback = Mutex::new(callback);
                worker_shared.run(&callback);
            })
            .map_err(|err| NoxsError::ResourceExhausted(format!("spawning {name}: {err}")))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn raiser(&self) -> Arc<WorkerShared> {
        self.shared.clone()
    }

    /// Stops the worker, waiting for an in-flight callback unless called from the worker itself.
    pub(crate) fn stop(&mut self) {
        self.shared.request_stop();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            // The worker exits once the running callback returns.
            return;
        }
        if thread.join().is_err() {
            error!("notification worker panicked");
        }
    }
}

impl Drop for NotifyWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Watch {
    irq: Irq,
    worker: NotifyWorker,
}

#[derive(Default)]
struct CommState {
    grant: Option<GrantRef>,
    port: Option<EvtchnPort>,
    watch: Option<Watch>,
}

/// Page, grant and event channel backing one device instance.
pub struct CommChannel {
    hv: Arc<dyn Hypervisor>,
    remote: DomId,
    device_id: DeviceId,
    bus_id: BusId,
    page: ControlPage,
    state: Mutex<CommState>,
}

impl std::fmt::Debug for CommChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommChannel")
            .field("bus_id", &self.bus_id)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl CommChannel {
    /// Allocates the control page, grants it to the frontend and opens an unbound event channel.
    pub fn initialize(hv: Arc<dyn Hypervisor>, key: &DeviceKey) -> Result<Self> {
        let bus_id = BusId::from(key);
        let remote = key.frontend_id;

        let page = hv.alloc_page().map_err(|err| {
            warn!(bus_id = %bus_id, error = %err, "control page allocation failed");
            NoxsError::from(err)
        })?;

        let control = match ControlPage::format(
            page.mem.clone(),
            key.device_type,
            key.backend_id,
            key.device_id,
        ) {
            Ok(control) => control,
            Err(err) => {
                Self::release_page(&*hv, page);
                return Err(err.into());
            }
        };

        let grant = match hv.grant_foreign_access(remote, &page, false) {
            Ok(grant) => grant,
            Err(err) => {
                warn!(bus_id = %bus_id, error = %err, "granting control page failed");
                Self::release_page(&*hv, page);
                return Err(err.into());
            }
        };

        let port = match hv.alloc_unbound_evtchn(remote) {
            Ok(port) => port,
            Err(err) => {
                warn!(bus_id = %bus_id, error = %err, "event channel allocation failed");
                if let Err(err) = hv.end_foreign_access(grant) {
                    error!(bus_id = %bus_id, error = %err, "revoking control page grant failed");
                }
                return Err(err.into());
            }
        };

        let published = control
            .set_grant(grant)
            .and_then(|()| control.set_event_channel(port));
        if let Err(err) = published {
            Self::unwind(&*hv, &bus_id, Some(port), Some(grant));
            return Err(err.into());
        }

        debug!(bus_id = %bus_id, %grant, %port, "control page ready");
        Ok(Self {
            hv,
            remote,
            device_id: key.device_id,
            bus_id,
            page: control,
            state: Mutex::new(CommState {
                grant: Some(grant),
                port: Some(port),
                watch: None,
            }),
        })
    }

    fn release_page(hv: &dyn Hypervisor, page: crate::hypervisor::GuestPage) {
        let frame = page.frame;
        if let Err(err) = hv.free_page(page) {
            error!(frame, error = %err, "releasing control page failed");
        }
    }

    fn unwind(
        hv: &dyn Hypervisor,
        bus_id: &BusId,
        port: Option<EvtchnPort>,
        grant: Option<GrantRef>,
    ) {
        if let Some(port) = port {
            if let Err(err) = hv.close_evtchn(port) {
                error!(bus_id = %bus_id, %port, error = %err, "closing event channel failed");
            }
        }
        if let Some(grant) = grant {
            if let Err(err) = hv.end_foreign_access(grant) {
                error!(bus_id = %bus_id, %grant, error = %err, "revoking control page grant failed");
            }
        }
    }

    pub fn bus_id(&self) -> &BusId {
        &self.bus_id
    }

    pub fn page(&self) -> &ControlPage {
        &self.page
    }

    pub fn remote(&self) -> DomId {
        self.remote
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hv
    }

    pub fn handle(&self) -> Result<CommHandle> {
        let state = lock(&self.state);
        match (state.grant, state.port) {
            (Some(grant), Some(port)) => Ok(CommHandle {
                device_id: self.device_id,
                grant,
                event_channel: port,
            }),
            _ => Err(NoxsError::Internal(format!(
                "{}: transport already torn down",
                self.bus_id
            ))),
        }
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.state).watch.is_some()
    }

    /// Starts the notification worker and routes the event channel's interrupt to it.
    pub fn watch_otherend(
        &self,
        gauge: &WorkerGauge,
        callback: impl FnMut(NotificationEvent) + Send + 'static,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if state.watch.is_some() {
            return Err(NoxsError::Internal(format!(
                "{}: otherend watch already armed",
                self.bus_id
            )));
        }
        let Some(port) = state.port else {
            return Err(NoxsError::Internal(format!(
                "{}: transport already torn down",
                self.bus_id
            )));
        };

        let name = format!("noxs-{}", self.bus_id);
        let mut worker = NotifyWorker::spawn(name, gauge, Box::new(callback))?;
        let raiser = worker.raiser();
        let irq = match self.hv.bind_irq(port, Arc::new(move || raiser.raise())) {
            Ok(irq) => irq,
            Err(err) => {
                warn!(bus_id = %self.bus_id, %port, error = %err, "binding event channel irq failed");
                drop(state);
                worker.stop();
                return Err(err.into());
            }
        };
        state.watch = Some(Watch { irq, worker });
        drop(state);

        self.page.set_backend_watch_state(WatchState::Requested)?;
        debug!(bus_id = %self.bus_id, %port, ?irq, "watching otherend");
        Ok(())
    }

    /// Unbinds the interrupt and stops the worker. Safe to call repeatedly.
    pub fn free_otherend_watch(&self) {
        let Some(mut watch) = lock(&self.state).watch.take() else {
            return;
        };
        if let Err(err) = self.page.set_backend_watch_state(WatchState::None) {
            warn!(bus_id = %self.bus_id, error = %err, "clearing watch state failed");
        }
        if let Err(err) = self.hv.unbind_irq(watch.irq) {
            error!(bus_id = %self.bus_id, irq = ?watch.irq, error = %err, "unbinding irq failed");
        }
        watch.worker.stop();
        debug!(bus_id = %self.bus_id, "otherend watch released");
    }

    /// Closes the event channel and revokes the grant. Safe to call repeatedly.
    pub fn teardown(&self) {
        self.free_otherend_watch();
        let (port, grant) = {
            let mut state = lock(&self.state);
            (state.port.take(), state.grant.take())
        };
        if port.is_none() && grant.is_none() {
            return;
        }
        Self::unwind(&*self.hv, &self.bus_id, port, grant);
        debug!(bus_id = %self.bus_id, "transport torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        let state = lock(&self.state);
        state.port.is_none() && state.grant.is_none()
    }

    /// Kicks the frontend.
    pub fn notify(&self) -> Result<()> {
        let port = lock(&self.state).port;
        match port {
            Some(port) => Ok(self.hv.notify(port)?),
            None => Ok(()),
        }
    }
}

impl Drop for CommChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}
