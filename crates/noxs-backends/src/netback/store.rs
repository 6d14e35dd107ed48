use noxs_abi::{EvtchnPort, QueueSlot, VifFeatures, VifPage};
use noxs_bus::{check_locator, NoxsError, QueueLocator, Result, RingStore};

/// Network negotiation fields of one control page.
pub struct VifStore<'a> {
    page: VifPage<'a>,
}

impl<'a> VifStore<'a> {
    pub fn new(page: VifPage<'a>) -> Self {
        Self { page }
    }

    /// Fails unless the frontend asked for copying receive.
    pub fn require_rx_copy(&self) -> Result<()> {
        if self.page.request_rx_copy()? {
            Ok(())
        } else {
            Err(NoxsError::protocol("frontend does not request rx-copy"))
        }
    }
}

/// Validates the offload flags a frontend published.
pub fn check_offloads(features: VifFeatures) -> Result<()> {
    for (gso, prefix, name) in [
        (VifFeatures::GSO_TCPV4, VifFeatures::GSO_TCPV4_PREFIX, "tcpv4"),
        (VifFeatures::GSO_TCPV6, VifFeatures::GSO_TCPV6_PREFIX, "tcpv6"),
    ] {
        if features.contains(gso | prefix) {
            return Err(NoxsError::protocol(format!(
                "frontend requested both gso-{name} and gso-{name}-prefix"
            )));
        }
    }
    Ok(())
}

impl RingStore for VifStore<'_> {
    type Features = VifFeatures;

    fn advertise_features(&self, features: VifFeatures) -> Result<()> {
        Ok(self.page.set_backend_features(features)?)
    }

    fn peer_features(&self) -> Result<VifFeatures> {
        let features = self.page.frontend_features()?;
        check_offloads(features)?;
        Ok(features)
    }

    fn advertise_max_queues(&self, max: u32) -> Result<()> {
        Ok(self.page.set_max_queues(max)?)
    }

    fn requested_queues(&self) -> Result<u32> {
        Ok(self.page.num_queues()?)
    }

    fn read_queue(&self, slot: QueueSlot) -> Result<QueueLocator> {
        let record = self.page.queue(slot)?;
        let locator = QueueLocator {
            ring_refs: vec![record.tx_ring_ref, record.rx_ring_ref],
            event_channel: record.tx_event_channel,
            rx_event_channel: (record.rx_event_channel != EvtchnPort::INVALID)
                .then_some(record.rx_event_channel),
        };
        check_locator(slot, &locator)?;
        Ok(locator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noxs_abi::{ControlPage, DeviceType, GrantRef, PageMemory, VifQueueRecord};
    use std::sync::Arc;

    fn page() -> ControlPage {
        ControlPage::format(Arc::new(PageMemory::zeroed()), DeviceType::Vif, 0, 0).unwrap()
    }

    #[test]
    fn split_channels_become_a_second_event_channel() {
        let page = page();
        let vif = page.vif().unwrap();
        vif.set_queue(
            QueueSlot::Inline,
            VifQueueRecord {
                tx_ring_ref: GrantRef(20),
                rx_ring_ref: GrantRef(21),
                tx_event_channel: EvtchnPort(3),
                rx_event_channel: EvtchnPort(4),
            },
        )
        .unwrap();

        let locator = VifStore::new(vif).read_queue(QueueSlot::Inline).unwrap();
        assert_eq!(locator.ring_refs, vec![GrantRef(20), GrantRef(21)]);
        assert_eq!(
            locator.event_channels().collect::<Vec<_>>(),
            vec![EvtchnPort(3), EvtchnPort(4)]
        );
    }

    #[test]
    fn gso_and_prefix_are_exclusive() {
        assert!(check_offloads(VifFeatures::GSO_TCPV4 | VifFeatures::GSO_TCPV6_PREFIX).is_ok());
        assert!(
            check_offloads(VifFeatures::GSO_TCPV6 | VifFeatures::GSO_TCPV6_PREFIX)
                .unwrap_err()
                .is_protocol_violation()
        );
    }

    #[test]
    fn rx_copy_is_required() {
        let page = page();
        let vif = page.vif().unwrap();
        let store = VifStore::new(vif);
        assert!(store.require_rx_copy().unwrap_err().is_protocol_violation());
        vif.set_request_rx_copy(true).unwrap();
        assert!(store.require_rx_copy().is_ok());
    }
}
