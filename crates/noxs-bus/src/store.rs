//! Ring/queue negotiation contract.
//!
//! Drivers negotiate through a [`RingStore`] instead of touching the control page, so block and
//! network logic stays independent of how the details are transported. Every read returns a
//! [`Result`]: malformed peer data is a [`NoxsError::ProtocolViolation`], never a sentinel.

use noxs_abi::{EvtchnPort, GrantRef, QueueSlot};

use crate::error::{NoxsError, Result};

/// Where one negotiated queue lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLocator {
    /// Ring pages granted by the frontend, in ring order.
    pub ring_refs: Vec<GrantRef>,
    pub event_channel: EvtchnPort,
    /// Separate receive-side channel, when the device type splits them.
    pub rx_event_channel: Option<EvtchnPort>,
}

impl QueueLocator {
    pub fn event_channels(&self) -> impl Iterator<Item = EvtchnPort> + '_ {
        std::iter::once(self.event_channel).chain(self.rx_event_channel)
    }
}

pub trait RingStore {
    type Features: Copy;

    /// Publishes the features this backend supports.
    fn advertise_features(&self, features: Self::Features) -> Result<()>;

    fn peer_features(&self) -> Result<Self::Features>;

    /// Publishes the largest queue count the frontend may request.
    fn advertise_max_queues(&self, max: u32) -> Result<()>;

    /// Queue count requested by the frontend, unvalidated.
    fn requested_queues(&self) -> Result<u32>;

    /// Reads one queue's locator.
    fn read_queue(&self, slot: QueueSlot) -> Result<QueueLocator>;
}

/// Validates a requested queue count against the backend maximum.
pub fn negotiate_queue_count(requested: u32, max: u32) -> Result<u32> {
    if requested == 0 {
        return Err(NoxsError::protocol("0 queues requested"));
    }
    if requested > max {
        return Err(NoxsError::protocol(format!(
            "{requested} queues requested, maximum is {max}"
        )));
    }
    Ok(requested)
}

/// Negotiates the queue count and reads one locator per queue.
pub fn resolve_queues<S: RingStore + ?Sized>(store: &S, max: u32) -> Result<Vec<QueueLocator>> {
    let count = negotiate_queue_count(store.requested_queues()?, max)? as usize;
    (0..count)
        .map(|index| store.read_queue(QueueSlot::for_queue(index, count)))
        .collect()
}

/// Rejects grant references and ports the frontend left unset.
pub fn check_locator(slot: QueueSlot, locator: &QueueLocator) -> Result<()> {
    if let Some(pos) = locator.ring_refs.iter().position(|r| !r.is_valid()) {
        return Err(NoxsError::protocol(format!(
            "{slot:?}: ring ref {pos} not published"
        )));
    }
    if !locator.event_channel.is_valid() {
        return Err(NoxsError::protocol(format!(
            "{slot:?}: event channel not published"
        )));
    }
    Ok(())
}
