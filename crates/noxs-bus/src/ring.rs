use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use noxs_abi::{DomId, EvtchnPort, PageMemory};
use tracing::{debug, error};

use crate::error::{NoxsError, Result};
use crate::hypervisor::{Hypervisor, HypervisorError, Irq, MapHandle};
use crate::store::QueueLocator;

fn peer_fault(label: &str, err: HypervisorError) -> NoxsError {
    if err.is_bad_reference() {
        NoxsError::protocol(format!("{label}: {err}"))
    } else {
        err.into()
    }
}

/// Mapped ring pages and bound event channels of one negotiated queue.
///
/// The payload protocol on top of the rings lives elsewhere; this only owns the resources and
/// counts kicks from the frontend.
pub struct RingBinding {
    hv: Arc<dyn Hypervisor>,
    label: String,
    maps: Vec<(MapHandle, Arc<PageMemory>)>,
    channels: Vec<(EvtchnPort, Irq)>,
    kicks: Arc<AtomicU64>,
}

impl std::fmt::Debug for RingBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBinding")
            .field("label", &self.label)
            .field("grants", &self.maps.len())
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl RingBinding {
    /// Maps every ring grant of `locator` and binds its event channel(s).
    ///
    /// On failure everything mapped or bound so far is released again.
    pub fn map(
        hv: &Arc<dyn Hypervisor>,
        remote: DomId,
        label: String,
        locator: &QueueLocator,
    ) -> Result<Self> {
        let mut binding = Self {
            hv: hv.clone(),
            label,
            maps: Vec::with_capacity(locator.ring_refs.len()),
            channels: Vec::new(),
            kicks: Arc::new(AtomicU64::new(0)),
        };

        for &gref in &locator.ring_refs {
            let mapped = hv
                .map_grant_ref(remote, gref)
                .map_err(|err| peer_fault(&binding.label, err))?;
            binding.maps.push(mapped);
        }

        for remote_port in locator.event_channels() {
            let port = hv
                .bind_interdomain_evtchn(remote, remote_port)
                .map_err(|err| peer_fault(&binding.label, err))?;
            let kicks = binding.kicks.clone();
            let irq = match hv.bind_irq(
                port,
                Arc::new(move || {
                    kicks.fetch_add(1, Ordering::Relaxed);
                }),
            ) {
                Ok(irq) => irq,
                Err(err) => {
                    if let Err(close) = hv.close_evtchn(port) {
                        error!(label = %binding.label, %port, error = %close, "closing ring event channel failed");
                    }
                    return Err(err.into());
                }
            };
            binding.channels.push((port, irq));
        }

        debug!(
            label = %binding.label,
            grants = binding.maps.len(),
            channels = binding.channels.len(),
            "ring mapped"
        );
        Ok(binding)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn grant_count(&self) -> usize {
        self.maps.len()
    }

    pub fn event_channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Mapped ring pages in ring order.
    pub fn pages(&self) -> impl Iterator<Item = &Arc<PageMemory>> {
        self.maps.iter().map(|(_, page)| page)
    }

    /// Interrupts received from the frontend so far.
    pub fn kicks(&self) -> u64 {
        self.kicks.load(Ordering::Relaxed)
    }

    /// Signals the frontend on the first bound channel.
    pub fn notify(&self) -> Result<()> {
        match self.channels.first() {
            Some(&(port, _)) => Ok(self.hv.notify(port)?),
            None => Ok(()),
        }
    }

    /// Releases every binding. Safe to call repeatedly.
    pub fn unmap(&mut self) {
        for (port, irq) in self.channels.drain(..) {
            if let Err(err) = self.hv.unbind_irq(irq) {
                error!(label = %self.label, ?irq, error = %err, "unbinding ring irq failed");
            }
            if let Err(err) = self.hv.close_evtchn(port) {
                error!(label = %self.label, %port, error = %err, "closing ring event channel failed");
            }
        }
        for (handle, _) in self.maps.drain(..) {
            if let Err(err) = self.hv.unmap_grant_ref(handle) {
                error!(label = %self.label, ?handle, error = %err, "unmapping ring grant failed");
            }
        }
    }
}

impl Drop for RingBinding {
    fn drop(&mut self) {
        self.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{HvOp, SimHypervisor};
    use noxs_abi::GrantRef;

    fn frontend_queue(sim: &SimHypervisor, refs: usize) -> QueueLocator {
        let fe = sim.domain(1);
        let ring_refs = (0..refs)
            .map(|_| {
                let page = fe.alloc_page().unwrap();
                fe.grant_foreign_access(0, &page, false).unwrap()
            })
            .collect();
        QueueLocator {
            ring_refs,
            event_channel: fe.alloc_unbound_evtchn(0).unwrap(),
            rx_event_channel: None,
        }
    }

    #[test]
    fn maps_and_releases_everything() {
        let sim = SimHypervisor::new();
        let hv: Arc<dyn Hypervisor> = sim.domain(0);
        let locator = frontend_queue(&sim, 2);

        let mut ring = RingBinding::map(&hv, 1, "vbd-1-0/queue-0".into(), &locator).unwrap();
        assert_eq!(ring.grant_count(), 2);
        assert_eq!(ring.event_channel_count(), 1);
        let stats = sim.stats(0);
        assert_eq!((stats.mappings, stats.ports, stats.irqs), (2, 1, 1));

        sim.domain(1).notify(locator.event_channel).unwrap();
        assert_eq!(ring.kicks(), 1);

        ring.unmap();
        ring.unmap();
        assert!(sim.stats(0).is_empty());
    }

    #[test]
    fn bad_grant_is_a_protocol_violation_and_unwinds() {
        let sim = SimHypervisor::new();
        let hv: Arc<dyn Hypervisor> = sim.domain(0);
        let mut locator = frontend_queue(&sim, 2);
        locator.ring_refs.push(GrantRef(4242));

        let err = RingBinding::map(&hv, 1, "q".into(), &locator).unwrap_err();
        assert!(err.is_protocol_violation(), "{err}");
        assert!(sim.stats(0).is_empty());
    }

    #[test]
    fn irq_exhaustion_unwinds_channel_and_maps() {
        let sim = SimHypervisor::new();
        let hv: Arc<dyn Hypervisor> = sim.domain(0);
        let locator = frontend_queue(&sim, 1);
        sim.fail_next(0, HvOp::BindIrq);

        let err = RingBinding::map(&hv, 1, "q".into(), &locator).unwrap_err();
        assert!(matches!(err, NoxsError::ResourceExhausted(_)));
        assert!(sim.stats(0).is_empty());
    }
}
