//! Virtual block device backend.
//!
//! Publishes disk geometry and capabilities at probe time, then maps one ring per queue the
//! frontend requested once it reports `Initialised`. Request processing on top of the rings is
//! left to the storage layer, which holds [`IoRef`](noxs_bus::IoRef)s while requests are in
//! flight.

mod store;

pub use store::VbdStore;

use noxs_abi::layout::NATIVE_PROTOCOL;
use noxs_abi::{DeviceConfig, DeviceType, VbdConfig, VbdFeatures, XenbusState};
use noxs_bus::{
    negotiate_queue_count, resolve_queues, BackendConfig, Device, DeviceDriver, NoxsError,
    Result, RingBinding, RingStore,
};
use tracing::{debug, info};

/// Indirect descriptor segments offered to frontends.
pub const MAX_INDIRECT_SEGMENTS: u32 = 256;

/// `info` bit marking a read-only disk.
pub const VDISK_READONLY: u32 = 0x4;

/// Ring ABI the frontend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkProtocol {
    /// No protocol published; the frontend uses ours.
    Native,
    X86_32,
    X86_64,
}

impl BlkProtocol {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "" => Ok(BlkProtocol::Native),
            "x86_32-abi" => Ok(BlkProtocol::X86_32),
            "x86_64-abi" => Ok(BlkProtocol::X86_64),
            other => Err(NoxsError::protocol(format!("unknown ring protocol {other:?}"))),
        }
    }

    /// Whether rings in this ABI can be used without translation.
    pub fn is_native(self) -> bool {
        match self {
            BlkProtocol::Native => true,
            BlkProtocol::X86_32 => NATIVE_PROTOCOL == "x86_32-abi",
            BlkProtocol::X86_64 => NATIVE_PROTOCOL == "x86_64-abi",
        }
    }
}

/// Per-device state of the block backend.
#[derive(Debug)]
pub struct BlkBackend {
    config: VbdConfig,
    rings: Vec<RingBinding>,
    protocol: Option<BlkProtocol>,
    persistent: bool,
}

impl BlkBackend {
    pub fn config(&self) -> &VbdConfig {
        &self.config
    }

    pub fn rings(&self) -> &[RingBinding] {
        &self.rings
    }

    /// Negotiated ring ABI, once connected.
    pub fn protocol(&self) -> Option<BlkProtocol> {
        self.protocol
    }

    pub fn persistent_grants(&self) -> bool {
        self.persistent
    }

    fn features(&self) -> VbdFeatures {
        let cfg = &self.config;
        let mut features = VbdFeatures::INDIRECT;
        features.set(VbdFeatures::FLUSH_CACHE | VbdFeatures::BARRIER, cfg.flush);
        features.set(VbdFeatures::PERSISTENT, cfg.persistent);
        features.set(VbdFeatures::DISCARD, cfg.discard);
        features.set(VbdFeatures::READONLY, cfg.readonly);
        features
    }
}

#[derive(Debug, Clone)]
pub struct BlkbackDriver {
    max_queues: u32,
    max_ring_page_order: u32,
}

impl BlkbackDriver {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            max_queues: config.max_queues,
            max_ring_page_order: config.max_ring_page_order,
        }
    }

    fn store<'a>(&self, dev: &'a Device) -> Result<VbdStore<'a>> {
        Ok(VbdStore::new(dev.page().vbd()?, self.max_ring_page_order))
    }
}

impl DeviceDriver for BlkbackDriver {
    type Backend = BlkBackend;
    const DEVICE_TYPE: DeviceType = DeviceType::Vbd;

    fn probe(&self, dev: &Device, config: &DeviceConfig) -> Result<BlkBackend> {
        let DeviceConfig::Vbd(config) = config else {
            return Err(NoxsError::InvalidArgument(format!(
                "{} config for a vbd device",
                config.device_type()
            )));
        };
        negotiate_queue_count(config.num_queues, self.max_queues)?;

        let backend = BlkBackend {
            config: config.clone(),
            rings: Vec::new(),
            protocol: None,
            persistent: false,
        };
        let store = self.store(dev)?;
        store.advertise_features(backend.features())?;
        store.advertise_max_queues(self.max_queues)?;

        let vbd = dev.page().vbd()?;
        vbd.set_max_indirect_segments(MAX_INDIRECT_SEGMENTS)?;
        vbd.set_num_queues(config.num_queues)?;
        let info = if config.readonly { VDISK_READONLY } else { 0 };
        vbd.set_geometry(
            config.sectors,
            config.sector_size,
            config.physical_sector_size,
            info,
        )?;
        if config.discard {
            vbd.set_discard(config.sector_size, 0)?;
        }

        dev.switch_state(XenbusState::InitWait)?;
        debug!(bus_id = %dev.bus_id(), sectors = config.sectors, "vbd probed");
        Ok(backend)
    }

    fn connect(&self, dev: &Device, backend: &mut BlkBackend) -> Result<()> {
        let store = self.store(dev)?;
        let protocol = BlkProtocol::parse(&store.protocol()?)?;
        let persistent = store.peer_features()?.contains(VbdFeatures::PERSISTENT);

        let queues = resolve_queues(&store, self.max_queues)?;
        let rings = queues
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
            queues = rings.len(),
            order = store.ring_page_order()?,
            ?protocol,
            persistent,
            "vbd rings mapped"
        );
        backend.rings = rings;
        backend.protocol = Some(protocol);
        backend.persistent = persistent && backend.config.persistent;
        Ok(())
    }

    fn disconnect(&self, dev: &Device, backend: &mut BlkBackend) -> Result<()> {
        let inflight = dev.inflight();
        if inflight > 0 {
            return Err(NoxsError::Busy(format!(
                "{}: {inflight} requests in flight",
                dev.bus_id()
            )));
        }
        if !backend.rings.is_empty() {
            debug!(bus_id = %dev.bus_id(), queues = backend.rings.len(), "vbd rings unmapped");
        }
        backend.rings.clear();
        backend.protocol = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_strings() {
        assert_eq!(BlkProtocol::parse("").unwrap(), BlkProtocol::Native);
        assert_eq!(BlkProtocol::parse("x86_32-abi").unwrap(), BlkProtocol::X86_32);
        assert_eq!(BlkProtocol::parse("x86_64-abi").unwrap(), BlkProtocol::X86_64);
        assert!(BlkProtocol::parse("arm-abi").unwrap_err().is_protocol_violation());
        assert!(BlkProtocol::parse(NATIVE_PROTOCOL).unwrap().is_native());
    }

    #[test]
    fn features_follow_the_config() {
        let mut config = VbdConfig::new(1 << 20);
        config.readonly = true;
        config.flush = false;
        let backend = BlkBackend {
            config,
            rings: Vec::new(),
            protocol: None,
            persistent: false,
        };
        let features = backend.features();
        assert!(features.contains(VbdFeatures::READONLY | VbdFeatures::PERSISTENT));
        assert!(!features.intersects(VbdFeatures::FLUSH_CACHE | VbdFeatures::BARRIER));
    }
}
