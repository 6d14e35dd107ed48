use noxs_abi::{QueueSlot, VbdFeatures, VbdPage};
use noxs_bus::{check_locator, NoxsError, QueueLocator, Result, RingStore};

/// Block negotiation fields of one control page.
pub struct VbdStore<'a> {
    page: VbdPage<'a>,
    max_ring_page_order: u32,
}

impl<'a> VbdStore<'a> {
    pub fn new(page: VbdPage<'a>, max_ring_page_order: u32) -> Self {
        Self {
            page,
            max_ring_page_order,
        }
    }

    /// Ring page order requested by the frontend.
    pub fn ring_page_order(&self) -> Result<u32> {
        let order = self.page.ring_page_order()?;
        if order > self.max_ring_page_order {
            return Err(NoxsError::protocol(format!(
                "ring page order {order} exceeds {}",
                self.max_ring_page_order
            )));
        }
        Ok(order)
    }

    /// Ring ABI string published by the frontend.
    pub fn protocol(&self) -> Result<String> {
        Ok(self.page.protocol()?)
    }
}

impl RingStore for VbdStore<'_> {
    type Features = VbdFeatures;

    fn advertise_features(&self, features: VbdFeatures) -> Result<()> {
        Ok(self.page.set_backend_features(features)?)
    }

    fn peer_features(&self) -> Result<VbdFeatures> {
        Ok(self.page.frontend_features()?)
    }

    fn advertise_max_queues(&self, max: u32) -> Result<()> {
        self.page.set_max_queues(max)?;
        Ok(self.page.set_max_ring_page_order(self.max_ring_page_order)?)
    }

    fn requested_queues(&self) -> Result<u32> {
        Ok(self.page.num_queues()?)
    }

    fn read_queue(&self, slot: QueueSlot) -> Result<QueueLocator> {
        let grants = 1usize << self.ring_page_order()?;
        let ring_refs = (0..grants)
            .map(|index| self.page.ring_ref(slot, index))
            .collect::<noxs_abi::Result<Vec<_>>>()?;
        let locator = QueueLocator {
            ring_refs,
            event_channel: self.page.ring_event_channel(slot)?,
            rx_event_channel: None,
        };
        check_locator(slot, &locator)?;
        Ok(locator)
    }
}
