//! In-memory hypervisor.
//!
//! [`SimHypervisor`] holds grant tables, event channels and interrupt bindings for any number of
//! domains; [`SimDomain`] is one domain's view of it and implements [`Hypervisor`]. Every
//! allocation is accounted per domain ([`SimStats`]) so tests can assert that teardown paths
//! leave nothing behind, and [`SimHypervisor::fail_next`] injects allocation failures.
//!
//! Interrupt handlers are always invoked after the internal lock is released, so a handler may
//! call back into the hypervisor.

mod frontend;

pub use frontend::SimFrontend;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use noxs_abi::{DomId, EvtchnPort, GrantRef, PageMemory};

use crate::hypervisor::{
    GuestPage, HvResult, Hypervisor, HypervisorError, Irq, IrqHandler, MapHandle,
};

/// Operations that can be made to fail with [`SimHypervisor::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HvOp {
    AllocPage,
    GrantAccess,
    MapGrant,
    AllocEvtchn,
    BindInterdomain,
    BindIrq,
}

impl HvOp {
    fn error(self) -> HypervisorError {
        match self {
            HvOp::AllocPage | HvOp::MapGrant => HypervisorError::OutOfMemory,
            HvOp::GrantAccess => HypervisorError::GrantTableFull,
            HvOp::AllocEvtchn | HvOp::BindInterdomain => HypervisorError::NoFreePorts,
            HvOp::BindIrq => HypervisorError::NoFreeIrqs,
        }
    }
}

/// Live resources owned by one domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub pages: usize,
    pub grants: usize,
    pub mappings: usize,
    pub ports: usize,
    pub irqs: usize,
}

impl SimStats {
    pub fn is_empty(&self) -> bool {
        *self == SimStats::default()
    }
}

#[derive(Debug)]
struct PageEntry {
    owner: DomId,
    mem: Arc<PageMemory>,
}

#[derive(Debug)]
struct GrantEntry {
    owner: DomId,
    remote: DomId,
    frame: u64,
    maps: usize,
    revoked: bool,
}

#[derive(Debug)]
struct MapEntry {
    mapper: DomId,
    gref: GrantRef,
}

#[derive(Debug)]
struct PortEntry {
    remote: DomId,
    peer: Option<(DomId, EvtchnPort)>,
    irq: Option<Irq>,
    pending: bool,
}

struct IrqEntry {
    owner: DomId,
    port: EvtchnPort,
    handler: IrqHandler,
}

#[derive(Default)]
struct SimState {
    next_frame: u64,
    pages: HashMap<u64, PageEntry>,
    next_gref: u32,
    grants: BTreeMap<GrantRef, GrantEntry>,
    grant_limit: Option<usize>,
    next_map: u64,
    mappings: HashMap<MapHandle, MapEntry>,
    next_port: HashMap<DomId, u32>,
    ports: BTreeMap<(DomId, EvtchnPort), PortEntry>,
    next_irq: u32,
    irqs: HashMap<Irq, IrqEntry>,
    faults: Vec<(DomId, HvOp)>,
}

impl SimState {
    fn take_fault(&mut self, dom: DomId, op: HvOp) -> HvResult<()> {
        match self.faults.iter().position(|&(d, o)| d == dom && o == op) {
            Some(idx) => {
                self.faults.remove(idx);
                Err(op.error())
            }
            None => Ok(()),
        }
    }

    fn alloc_port(&mut self, dom: DomId, entry: PortEntry) -> EvtchnPort {
        let next = self.next_port.entry(dom).or_insert(1);
        let port = EvtchnPort(*next);
        *next += 1;
        self.ports.insert((dom, port), entry);
        port
    }

    fn release_page(&mut self, frame: u64) {
        self.pages.remove(&frame);
    }

    fn drop_grant(&mut self, gref: GrantRef) {
        if let Some(grant) = self.grants.remove(&gref) {
            self.release_page(grant.frame);
        }
    }

    fn remove_irq(&mut self, irq: Irq) -> Option<IrqEntry> {
        let entry = self.irqs.remove(&irq)?;
        if let Some(port) = self.ports.get_mut(&(entry.owner, entry.port)) {
            port.irq = None;
        }
        Some(entry)
    }
}

#[derive(Default)]
struct SimShared {
    state: Mutex<SimState>,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory hypervisor.
#[derive(Clone)]
pub struct SimHypervisor {
    shared: Arc<SimShared>,
}

impl Default for SimHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimHypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHypervisor").finish_non_exhaustive()
    }
}

impl SimHypervisor {
    pub fn new() -> Self {
        let shared = SimShared::default();
        // Low references are reserved, mirroring real grant tables.
        shared.lock().next_gref = 8;
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Handle for domain `domid`.
    pub fn domain(&self, domid: DomId) -> Arc<SimDomain> {
        Arc::new(SimDomain {
            domid,
            shared: self.shared.clone(),
        })
    }

    /// Makes the next `op` issued by `domid` fail with the matching exhaustion error.
    pub fn fail_next(&self, domid: DomId, op: HvOp) {
        self.shared.lock().faults.push((domid, op));
    }

    /// Caps the total number of live grants across all domains.
    pub fn set_grant_limit(&self, limit: Option<usize>) {
        self.shared.lock().grant_limit = limit;
    }

    pub fn stats(&self, domid: DomId) -> SimStats {
        let state = self.shared.lock();
        SimStats {
            pages: state.pages.values().filter(|p| p.owner == domid).count(),
            grants: state.grants.values().filter(|g| g.owner == domid).count(),
            mappings: state.mappings.values().filter(|m| m.mapper == domid).count(),
            ports: state.ports.keys().filter(|(d, _)| *d == domid).count(),
            irqs: state.irqs.values().filter(|i| i.owner == domid).count(),
        }
    }

    /// Remote domain a grant was issued to, if it is still live.
    pub fn grant_remote(&self, gref: GrantRef) -> Option<DomId> {
        self.shared.lock().grants.get(&gref).map(|g| g.remote)
    }

    /// Whether `port` of `domid` is connected to a peer.
    pub fn is_connected(&self, domid: DomId, port: EvtchnPort) -> bool {
        self.shared
            .lock()
            .ports
            .get(&(domid, port))
            .is_some_and(|p| p.peer.is_some())
    }
}

/// One domain's view of a [`SimHypervisor`].
pub struct SimDomain {
    domid: DomId,
    shared: Arc<SimShared>,
}

impl std::fmt::Debug for SimDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDomain")
            .field("domid", &self.domid)
            .finish_non_exhaustive()
    }
}

impl Hypervisor for SimDomain {
    fn domid(&self) -> DomId {
        self.domid
    }

    fn alloc_page(&self) -> HvResult<GuestPage> {
        let mut state = self.shared.lock();
        state.take_fault(self.domid, HvOp::AllocPage)?;
        let frame = state.next_frame;
        state.next_frame += 1;
        let mem = Arc::new(PageMemory::zeroed());
        state.pages.insert(
            frame,
            PageEntry {
                owner: self.domid,
                mem: mem.clone(),
            },
        );
        Ok(GuestPage { frame, mem })
    }

    fn free_page(&self, page: GuestPage) -> HvResult<()> {
        let mut state = self.shared.lock();
        match state.pages.get(&page.frame) {
            Some(entry) if entry.owner == self.domid => {}
            _ => return Err(HypervisorError::BadFrame(page.frame)),
        }
        if state.grants.values().any(|g| g.frame == page.frame) {
            return Err(HypervisorError::BadFrame(page.frame));
        }
        state.release_page(page.frame);
        Ok(())
    }

    fn grant_foreign_access(
        &self,
        remote: DomId,
        page: &GuestPage,
        _readonly: bool,
    ) -> HvResult<GrantRef> {
        let mut state = self.shared.lock();
        state.take_fault(self.domid, HvOp::GrantAccess)?;
        if !state
            .pages
            .get(&page.frame)
            .is_some_and(|p| p.owner == self.domid)
        {
            return Err(HypervisorError::BadFrame(page.frame));
        }
        if state
            .grant_limit
            .is_some_and(|limit| state.grants.len() >= limit)
        {
            return Err(HypervisorError::GrantTableFull);
        }
        let gref = GrantRef(state.next_gref);
        state.next_gref += 1;
        state.grants.insert(
            gref,
            GrantEntry {
                owner: self.domid,
                remote,
                frame: page.frame,
                maps: 0,
                revoked: false,
            },
        );
        Ok(gref)
    }

    fn end_foreign_access(&self, gref: GrantRef) -> HvResult<()> {
        let mut state = self.shared.lock();
        let entry = match state.grants.get_mut(&gref) {
            Some(entry) if entry.owner == self.domid && !entry.revoked => entry,
            _ => return Err(HypervisorError::BadGrant(gref)),
        };
        if entry.maps > 0 {
            entry.revoked = true;
            return Ok(());
        }
        state.drop_grant(gref);
        Ok(())
    }

    fn map_grant_ref(
        &self,
        remote: DomId,
        gref: GrantRef,
    ) -> HvResult<(MapHandle, Arc<PageMemory>)> {
        let mut state = self.shared.lock();
        state.take_fault(self.domid, HvOp::MapGrant)?;
        let frame = match state.grants.get_mut(&gref) {
            Some(entry) if entry.owner == remote && entry.remote == self.domid && !entry.revoked => {
                entry.maps += 1;
                entry.frame
            }
            _ => return Err(HypervisorError::BadGrant(gref)),
        };
        let Some(mem) = state.pages.get(&frame).map(|p| p.mem.clone()) else {
            return Err(HypervisorError::BadGrant(gref));
        };
        let handle = MapHandle(state.next_map);
        state.next_map += 1;
        state.mappings.insert(
            handle,
            MapEntry {
                mapper: self.domid,
                gref,
            },
        );
        Ok((handle, mem))
    }

    fn unmap_grant_ref(&self, handle: MapHandle) -> HvResult<()> {
        let mut state = self.shared.lock();
        match state.mappings.get(&handle) {
            Some(entry) if entry.mapper == self.domid => {}
            _ => return Err(HypervisorError::BadMapHandle(handle)),
        }
        if let Some(entry) = state.mappings.remove(&handle) {
            let released = match state.grants.get_mut(&entry.gref) {
                Some(grant) => {
                    grant.maps = grant.maps.saturating_sub(1);
                    grant.revoked && grant.maps == 0
                }
                None => false,
            };
            if released {
                state.drop_grant(entry.gref);
            }
        }
        Ok(())
    }

    fn alloc_unbound_evtchn(&self, remote: DomId) -> HvResult<EvtchnPort> {
        let mut state = self.shared.lock();
        state.take_fault(self.domid, HvOp::AllocEvtchn)?;
        Ok(state.alloc_port(
            self.domid,
            PortEntry {
                remote,
                peer: None,
                irq: None,
                pending: false,
            },
        ))
    }

    fn bind_interdomain_evtchn(
        &self,
        remote: DomId,
        remote_port: EvtchnPort,
    ) -> HvResult<EvtchnPort> {
        let mut state = self.shared.lock();
        state.take_fault(self.domid, HvOp::BindInterdomain)?;
        match state.ports.get(&(remote, remote_port)) {
            Some(entry) if entry.remote == self.domid && entry.peer.is_none() => {}
            _ => return Err(HypervisorError::BadPort(remote_port)),
        }
        let local = state.alloc_port(
            self.domid,
            PortEntry {
                remote,
                peer: Some((remote, remote_port)),
                irq: None,
                pending: false,
            },
        );
        if let Some(entry) = state.ports.get_mut(&(remote, remote_port)) {
            entry.peer = Some((self.domid, local));
        }
        Ok(local)
    }

    fn close_evtchn(&self, port: EvtchnPort) -> HvResult<()> {
        let mut state = self.shared.lock();
        let Some(entry) = state.ports.remove(&(self.domid, port)) else {
            return Err(HypervisorError::BadPort(port));
        };
        if let Some(irq) = entry.irq {
            state.irqs.remove(&irq);
        }
        if let Some(peer) = entry.peer {
            if let Some(peer_entry) = state.ports.get_mut(&peer) {
                peer_entry.peer = None;
            }
        }
        Ok(())
    }

    fn bind_irq(&self, port: EvtchnPort, handler: IrqHandler) -> HvResult<Irq> {
        let (irq, fire) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.take_fault(self.domid, HvOp::BindIrq)?;
            let irq = Irq(state.next_irq);
            let entry = state
                .ports
                .get_mut(&(self.domid, port))
                .ok_or(HypervisorError::BadPort(port))?;
            if entry.irq.is_some() {
                return Err(HypervisorError::AlreadyBound(port));
            }
            entry.irq = Some(irq);
            let fire = std::mem::take(&mut entry.pending);
            state.next_irq += 1;
            state.irqs.insert(
                irq,
                IrqEntry {
                    owner: self.domid,
                    port,
                    handler: handler.clone(),
                },
            );
            (irq, fire)
        };
        if fire {
            handler();
        }
        Ok(irq)
    }

    fn unbind_irq(&self, irq: Irq) -> HvResult<()> {
        let mut state = self.shared.lock();
        match state.irqs.get(&irq) {
            Some(entry) if entry.owner == self.domid => {}
            _ => return Err(HypervisorError::BadIrq(irq)),
        }
        state.remove_irq(irq);
        Ok(())
    }

    fn notify(&self, port: EvtchnPort) -> HvResult<()> {
        let handler = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let peer = state
                .ports
                .get(&(self.domid, port))
                .ok_or(HypervisorError::BadPort(port))?
                .peer;
            let Some(peer) = peer else {
                // Nobody bound to the other end yet.
                return Ok(());
            };
            let Some(peer_entry) = state.ports.get_mut(&peer) else {
                return Ok(());
            };
            match peer_entry.irq {
                Some(irq) => state.irqs.get(&irq).map(|entry| entry.handler.clone()),
                None => {
                    peer_entry.pending = true;
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn revoking_a_grant_frees_its_page() {
        let sim = SimHypervisor::new();
        let dom0 = sim.domain(0);
        let page = dom0.alloc_page().unwrap();
        let gref = dom0.grant_foreign_access(1, &page, false).unwrap();
        assert_eq!(sim.stats(0).pages, 1);
        assert_eq!(sim.stats(0).grants, 1);

        dom0.end_foreign_access(gref).unwrap();
        assert!(sim.stats(0).is_empty());
        assert_eq!(
            dom0.end_foreign_access(gref),
            Err(HypervisorError::BadGrant(gref))
        );
    }

    #[test]
    fn revoking_a_mapped_grant_defers_release() {
        let sim = SimHypervisor::new();
        let dom0 = sim.domain(0);
        let dom1 = sim.domain(1);
        let page = dom0.alloc_page().unwrap();
        let gref = dom0.grant_foreign_access(1, &page, false).unwrap();

        assert!(dom1.map_grant_ref(0, GrantRef(999)).is_err());
        let (handle, mem) = dom1.map_grant_ref(0, gref).unwrap();
        mem.write_u32(0, 7).unwrap();
        assert_eq!(page.mem.read_u32(0).unwrap(), 7);

        dom0.end_foreign_access(gref).unwrap();
        assert_eq!(sim.stats(0).grants, 1);
        assert!(dom1.map_grant_ref(0, gref).is_err());
        assert_eq!(
            dom0.end_foreign_access(gref),
            Err(HypervisorError::BadGrant(gref))
        );

        dom1.unmap_grant_ref(handle).unwrap();
        assert!(sim.stats(0).is_empty());
    }

    #[test]
    fn notify_reaches_bound_peer_and_latches_when_unbound() {
        let sim = SimHypervisor::new();
        let dom0 = sim.domain(0);
        let dom1 = sim.domain(1);
        let hits = Arc::new(AtomicUsize::new(0));

        let be_port = dom0.alloc_unbound_evtchn(1).unwrap();
        let fe_port = dom1.bind_interdomain_evtchn(0, be_port).unwrap();
        assert!(sim.is_connected(0, be_port));

        // Latched until a handler is bound.
        dom1.notify(fe_port).unwrap();
        let counter = hits.clone();
        let irq = dom0
            .bind_irq(
                be_port,
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        dom1.notify(fe_port).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        dom0.unbind_irq(irq).unwrap();
        dom0.close_evtchn(be_port).unwrap();
        dom1.close_evtchn(fe_port).unwrap();
        assert!(sim.stats(0).is_empty());
        assert!(sim.stats(1).is_empty());
    }

    #[test]
    fn injected_faults_fire_once() {
        let sim = SimHypervisor::new();
        let dom0 = sim.domain(0);
        sim.fail_next(0, HvOp::AllocEvtchn);
        assert_eq!(
            dom0.alloc_unbound_evtchn(1),
            Err(HypervisorError::NoFreePorts)
        );
        assert!(dom0.alloc_unbound_evtchn(1).is_ok());
    }
}
