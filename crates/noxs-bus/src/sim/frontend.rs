use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use noxs_abi::{
    ControlPage, DeviceType, DomId, EvtchnPort, GrantRef, QueueSlot, VifQueueRecord, WatchState,
    XenbusState,
};
use tracing::debug;

use crate::comm::{lock, CommHandle};
use crate::error::Result;
use crate::hypervisor::{Hypervisor, Irq, MapHandle};

const POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Resources {
    map: Option<MapHandle>,
    port: Option<EvtchnPort>,
    irq: Option<Irq>,
    ring_grants: Vec<GrantRef>,
    ring_ports: Vec<EvtchnPort>,
}

/// Frontend half of a device, driven by tests and tooling.
///
/// Maps the control page the backend granted, binds to its event channel and publishes
/// frontend state and ring details the way a guest driver would.
pub struct SimFrontend {
    hv: Arc<dyn Hypervisor>,
    backend: DomId,
    page: ControlPage,
    local_port: EvtchnPort,
    events: Arc<(Mutex<u64>, Condvar)>,
    res: Mutex<Resources>,
}

impl std::fmt::Debug for SimFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimFrontend")
            .field("domid", &self.hv.domid())
            .field("backend", &self.backend)
            .field("port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl SimFrontend {
    pub fn attach(
        hv: Arc<dyn Hypervisor>,
        backend: DomId,
        handle: CommHandle,
        device_type: DeviceType,
    ) -> Result<Self> {
        let mut res = Resources::default();
        let (map, mem) = hv.map_grant_ref(backend, handle.grant)?;
        res.map = Some(map);

        let page = match ControlPage::open(mem, Some(device_type)) {
            Ok(page) => page,
            Err(err) => {
                Self::release_resources(&*hv, &mut res);
                return Err(err.into());
            }
        };

        let port = match hv.bind_interdomain_evtchn(backend, handle.event_channel) {
            Ok(port) => port,
            Err(err) => {
                Self::release_resources(&*hv, &mut res);
                return Err(err.into());
            }
        };
        res.port = Some(port);

        let events = Arc::new((Mutex::new(0u64), Condvar::new()));
        let counter = events.clone();
        match hv.bind_irq(
            port,
            Arc::new(move || {
                *lock(&counter.0) += 1;
                counter.1.notify_all();
            }),
        ) {
            Ok(irq) => res.irq = Some(irq),
            Err(err) => {
                Self::release_resources(&*hv, &mut res);
                return Err(err.into());
            }
        }

        let frontend = Self {
            hv,
            backend,
            page,
            local_port: port,
            events,
            res: Mutex::new(res),
        };
        frontend
            .page
            .set_frontend_watch_state(WatchState::Requested)?;
        Ok(frontend)
    }

    pub fn page(&self) -> &ControlPage {
        &self.page
    }

    /// Publishes a frontend state and kicks the backend.
    pub fn set_state(&self, state: XenbusState) -> Result<()> {
        self.page.set_frontend_state(state)?;
        self.kick()
    }

    /// Publishes an arbitrary raw state value and kicks the backend.
    pub fn set_state_raw(&self, raw: u32) -> Result<()> {
        self.page.set_frontend_state_raw(raw)?;
        self.kick()
    }

    pub fn kick(&self) -> Result<()> {
        Ok(self.hv.notify(self.local_port)?)
    }

    pub fn backend_state(&self) -> Result<XenbusState> {
        Ok(self.page.backend_state()?)
    }

    /// Notifications received from the backend so far.
    pub fn notifications(&self) -> u64 {
        *lock(&self.events.0)
    }

    /// Waits until the backend publishes `state`.
    pub fn wait_for_backend_state(&self, state: XenbusState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.page.backend_state().ok() == Some(state) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let guard = lock(&self.events.0);
            let _ = self
                .events
                .1
                .wait_timeout(guard, (deadline - now).min(POLL_SLICE))
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Allocates and grants `count` ring pages to the backend.
    pub fn grant_ring_pages(&self, count: usize) -> Result<Vec<GrantRef>> {
        let mut refs = Vec::with_capacity(count);
        for _ in 0..count {
            let page = self.hv.alloc_page()?;
            let gref = match self.hv.grant_foreign_access(self.backend, &page, false) {
                Ok(gref) => gref,
                Err(err) => {
                    let _ = self.hv.free_page(page);
                    return Err(err.into());
                }
            };
            lock(&self.res).ring_grants.push(gref);
            refs.push(gref);
        }
        Ok(refs)
    }

    pub fn alloc_event_channel(&self) -> Result<EvtchnPort> {
        let port = self.hv.alloc_unbound_evtchn(self.backend)?;
        lock(&self.res).ring_ports.push(port);
        Ok(port)
    }

    /// Publishes `num_queues` block rings of `1 << order` pages each.
    pub fn publish_vbd_rings(&self, num_queues: u32, order: u32) -> Result<()> {
        let vbd = self.page.vbd()?;
        vbd.set_num_queues(num_queues)?;
        vbd.set_ring_page_order(order)?;
        let count = num_queues as usize;
        for index in 0..count {
            let refs = self.grant_ring_pages(1 << order)?;
            let port = self.alloc_event_channel()?;
            vbd.set_ring(QueueSlot::for_queue(index, count), port, &refs)?;
        }
        Ok(())
    }

    /// Publishes `num_queues` network queues, with separate rx channels when `split` is set.
    pub fn publish_vif_queues(&self, num_queues: u32, split: bool) -> Result<()> {
        let vif = self.page.vif()?;
        vif.set_num_queues(num_queues)?;
        vif.set_request_rx_copy(true)?;
        let count = num_queues as usize;
        for index in 0..count {
            let refs = self.grant_ring_pages(2)?;
            let tx_event_channel = self.alloc_event_channel()?;
            let rx_event_channel = if split {
                self.alloc_event_channel()?
            } else {
                EvtchnPort::INVALID
            };
            vif.set_queue(
                QueueSlot::for_queue(index, count),
                VifQueueRecord {
                    tx_ring_ref: refs[0],
                    rx_ring_ref: refs[1],
                    tx_event_channel,
                    rx_event_channel,
                },
            )?;
        }
        Ok(())
    }

    fn release_resources(hv: &dyn Hypervisor, res: &mut Resources) {
        if let Some(irq) = res.irq.take() {
            let _ = hv.unbind_irq(irq);
        }
        if let Some(port) = res.port.take() {
            let _ = hv.close_evtchn(port);
        }
        if let Some(map) = res.map.take() {
            let _ = hv.unmap_grant_ref(map);
        }
        for port in res.ring_ports.drain(..) {
            let _ = hv.close_evtchn(port);
        }
        for gref in res.ring_grants.drain(..) {
            if let Err(err) = hv.end_foreign_access(gref) {
                debug!(%gref, error = %err, "revoking ring grant failed");
            }
        }
    }

    /// Drops every binding and revokes the ring grants. Safe to call repeatedly.
    pub fn release(&self) {
        Self::release_resources(&*self.hv, &mut lock(&self.res));
    }
}

impl Drop for SimFrontend {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommChannel;
    use crate::error::NoxsError;
    use crate::sim::SimHypervisor;
    use noxs_abi::DeviceKey;

    #[test]
    fn attaches_and_exchanges_state() {
        let sim = SimHypervisor::new();
        let key = DeviceKey::new(DeviceType::Vbd, 0, 4, 0);
        let comm = CommChannel::initialize(sim.domain(0), &key).unwrap();
        comm.page().set_backend_state(XenbusState::InitWait).unwrap();

        let fe = SimFrontend::attach(sim.domain(4), 0, comm.handle().unwrap(), DeviceType::Vbd)
            .unwrap();
        assert_eq!(fe.backend_state().unwrap(), XenbusState::InitWait);
        assert_eq!(
            comm.page().frontend_watch_state().unwrap(),
            WatchState::Requested
        );

        fe.set_state(XenbusState::Initialised).unwrap();
        assert_eq!(
            comm.page().frontend_state().unwrap(),
            XenbusState::Initialised
        );

        comm.notify().unwrap();
        assert_eq!(fe.notifications(), 1);

        fe.publish_vbd_rings(2, 1).unwrap();
        assert_eq!(sim.stats(4).grants, 4);

        fe.release();
        comm.teardown();
        assert!(sim.stats(4).is_empty());
        assert!(sim.stats(0).is_empty());
    }

    #[test]
    fn wrong_device_type_is_rejected_and_unwound() {
        let sim = SimHypervisor::new();
        let key = DeviceKey::new(DeviceType::Vif, 0, 4, 0);
        let comm = CommChannel::initialize(sim.domain(0), &key).unwrap();
        let err = SimFrontend::attach(sim.domain(4), 0, comm.handle().unwrap(), DeviceType::Vbd)
            .unwrap_err();
        assert!(matches!(err, NoxsError::Layout(_)));
        assert!(sim.stats(4).is_empty());
    }
}
