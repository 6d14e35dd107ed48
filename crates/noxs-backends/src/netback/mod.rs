//! Virtual network interface backend.
//!
//! Each negotiated queue carries a tx and an rx ring grant plus one event channel, or two when
//! the frontend splits tx and rx notifications.

mod store;

pub use store::{check_offloads, VifStore};

use noxs_abi::{DeviceConfig, DeviceType, LayoutError, VifConfig, VifFeatures, XenbusState};
use noxs_bus::{
    negotiate_queue_count, resolve_queues, BackendConfig, Device, DeviceDriver, NoxsError,
    Result, RingBinding, RingStore,
};
use tracing::{debug, info};

/// Capabilities offered to every network frontend.
pub const BACKEND_FEATURES: VifFeatures = VifFeatures::SG
    .union(VifFeatures::GSO_TCPV4)
    .union(VifFeatures::GSO_TCPV4_PREFIX)
    .union(VifFeatures::GSO_TCPV6)
    .union(VifFeatures::GSO_TCPV6_PREFIX)
    .union(VifFeatures::IPV6_CSUM_OFFLOAD)
    .union(VifFeatures::RX_COPY)
    .union(VifFeatures::RX_NOTIFY)
    .union(VifFeatures::SPLIT_EVENT_CHANNELS);

/// Per-device state of the network backend.
#[derive(Debug)]
pub struct NetBackend {
    config: VifConfig,
    queues: Vec<RingBinding>,
    offloads: VifFeatures,
}

impl NetBackend {
    pub fn config(&self) -> &VifConfig {
        &self.config
    }

    pub fn queues(&self) -> &[RingBinding] {
        &self.queues
    }

    /// Offload flags the frontend enabled, once connected.
    pub fn offloads(&self) -> VifFeatures {
        self.offloads
    }
}

#[derive(Debug, Clone)]
pub struct NetbackDriver {
    max_queues: u32,
}

impl NetbackDriver {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            max_queues: config.max_queues,
        }
    }
}

fn config_field(err: LayoutError) -> NoxsError {
    match err {
        LayoutError::FieldTooLong { .. } => NoxsError::InvalidArgument(err.to_string()),
        other => other.into(),
    }
}

impl DeviceDriver for NetbackDriver {
    type Backend = NetBackend;
    const DEVICE_TYPE: DeviceType = DeviceType::Vif;

    fn probe(&self, dev: &Device, config: &DeviceConfig) -> Result<NetBackend> {
        let DeviceConfig::Vif(config) = config else {
            return Err(NoxsError::InvalidArgument(format!(
                "{} config for a vif device",
                config.device_type()
            )));
        };
        negotiate_queue_count(config.num_queues, self.max_queues)?;

        let vif = dev.page().vif()?;
        let store = VifStore::new(vif);
        store.advertise_features(BACKEND_FEATURES)?;
        store.advertise_max_queues(self.max_queues)?;

        vif.set_mac(config.mac)?;
        if let Some(ip) = config.ip {
            vif.set_ip(ip)?;
        }
        if let Some(bridge) = &config.bridge {
            vif.set_bridge(bridge).map_err(config_field)?;
        }
        vif.set_vif_id(dev.key().device_id)?;

        dev.switch_state(XenbusState::InitWait)?;
        debug!(bus_id = %dev.bus_id(), "vif probed");
        Ok(NetBackend {
            config: config.clone(),
            queues: Vec::new(),
            offloads: VifFeatures::empty(),
        })
    }

    fn connect(&self, dev: &Device, backend: &mut NetBackend) -> Result<()> {
        let store = VifStore::new(dev.page().vif()?);
        store.require_rx_copy()?;
        let offloads = store.peer_features()?;

        let queues = resolve_queues(&store, self.max_queues)?;
        let bindings = queues
            .iter()
            .enumerate()
            .map(|(index, locator)| {
                RingBinding::map(
                    dev.hypervisor(),
                    dev.otherend_id(),
                    dev.bus_id().queue(index),
                    locator,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            bus_id = %dev.bus_id(),
            queues = bindings.len(),
            split = bindings.iter().any(|q| q.event_channel_count() > 1),
            offloads = ?offloads,
            "vif queues mapped"
        );
        backend.queues = bindings;
        backend.offloads = offloads & BACKEND_FEATURES;
        Ok(())
    }

    fn disconnect(&self, dev: &Device, backend: &mut NetBackend) -> Result<()> {
        let inflight = dev.inflight();
        if inflight > 0 {
            return Err(NoxsError::Busy(format!(
                "{}: {inflight} packets in flight",
                dev.bus_id()
            )));
        }
        backend.queues.clear();
        backend.offloads = VifFeatures::empty();
        Ok(())
    }
}
