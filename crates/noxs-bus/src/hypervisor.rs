//! Hypervisor services the transport depends on.
//!
//! The trait is the only place noxs touches grant tables, event channels and interrupt
//! routing. [`crate::sim::SimHypervisor`] implements it in memory for tests and tooling.

use std::fmt;
use std::sync::Arc;

use noxs_abi::{DomId, EvtchnPort, GrantRef, PageMemory};
use thiserror::Error;

pub type HvResult<T> = std::result::Result<T, HypervisorError>;

/// Interrupt callback bound to a local event channel port.
///
/// Runs in the notifying context; it must not block.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Interrupt line bound to an event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Irq(pub u32);

/// Handle of a foreign grant mapped into the local domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapHandle(pub u64);

/// A page allocated to the local domain.
#[derive(Debug, Clone)]
pub struct GuestPage {
    pub frame: u64,
    pub mem: Arc<PageMemory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HypervisorError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("grant table full")]
    GrantTableFull,

    #[error("no free event channel ports")]
    NoFreePorts,

    #[error("no free irqs")]
    NoFreeIrqs,

    #[error("unknown page frame {0:#x}")]
    BadFrame(u64),

    #[error("invalid grant reference {0}")]
    BadGrant(GrantRef),

    #[error("invalid map handle {0:?}")]
    BadMapHandle(MapHandle),

    #[error("invalid event channel {0}")]
    BadPort(EvtchnPort),

    #[error("event channel {0} is already bound to an irq")]
    AlreadyBound(EvtchnPort),

    #[error("invalid irq {0:?}")]
    BadIrq(Irq),
}

impl HypervisorError {
    /// Failures caused by running out of a finite resource.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            HypervisorError::OutOfMemory
                | HypervisorError::GrantTableFull
                | HypervisorError::NoFreePorts
                | HypervisorError::NoFreeIrqs
        )
    }

    /// Failures caused by a reference or port the remote domain handed us.
    pub fn is_bad_reference(&self) -> bool {
        matches!(
            self,
            HypervisorError::BadGrant(_) | HypervisorError::BadPort(_)
        )
    }
}

/// Services of the hypervisor as seen from one domain.
pub trait Hypervisor: Send + Sync + fmt::Debug {
    /// Id of the calling domain.
    fn domid(&self) -> DomId;

    fn alloc_page(&self) -> HvResult<GuestPage>;

    /// Releases a page that was never granted.
    fn free_page(&self, page: GuestPage) -> HvResult<()>;

    fn grant_foreign_access(
        &self,
        remote: DomId,
        page: &GuestPage,
        readonly: bool,
    ) -> HvResult<GrantRef>;

    /// Revokes a grant and releases the page behind it.
    ///
    /// While the remote domain still maps the grant, release is deferred until its last unmap;
    /// no new mappings are accepted after revocation.
    fn end_foreign_access(&self, gref: GrantRef) -> HvResult<()>;

    fn map_grant_ref(&self, remote: DomId, gref: GrantRef)
        -> HvResult<(MapHandle, Arc<PageMemory>)>;

    fn unmap_grant_ref(&self, handle: MapHandle) -> HvResult<()>;

    /// Allocates a local port that `remote` may later bind to.
    fn alloc_unbound_evtchn(&self, remote: DomId) -> HvResult<EvtchnPort>;

    /// Connects a new local port to `remote_port` of `remote`.
    fn bind_interdomain_evtchn(&self, remote: DomId, remote_port: EvtchnPort)
        -> HvResult<EvtchnPort>;

    fn close_evtchn(&self, port: EvtchnPort) -> HvResult<()>;

    fn bind_irq(&self, port: EvtchnPort, handler: IrqHandler) -> HvResult<Irq>;

    fn unbind_irq(&self, irq: Irq) -> HvResult<()>;

    /// Signals the remote end of `port`.
    fn notify(&self, port: EvtchnPort) -> HvResult<()>;
}
