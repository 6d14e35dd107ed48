//! Device registry.
//!
//! Owns one bus per registered device type and serializes administrative operations under the
//! enumeration lock. The per-type indexes have their own short-lived locks, so a notification
//! worker can unregister its own device while an administrative call is running.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use noxs_abi::layout::DEV_COUNT_MAX;
use noxs_abi::{DeviceConfig, DeviceId, DeviceKey, DeviceType, DomId, DEVICE_ID_ANY};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusOps};
use crate::comm::{lock, CommHandle, WorkerGauge};
use crate::config::BackendConfig;
use crate::device::Device;
use crate::driver::{DeviceDriver, DriverCommand, GuestCloseReason};
use crate::error::{NoxsError, Result};
use crate::hypervisor::Hypervisor;

/// Per-create knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Online devices survive a frontend close and wait for it to reconnect.
    pub online: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self { online: true }
    }
}

/// Result of [`DeviceRegistry::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    /// Matching device ids, ascending.
    pub ids: Vec<DeviceId>,
    /// More devices matched than the capacity allowed.
    pub truncated: bool,
}

pub struct RegistryBuilder {
    hv: Arc<dyn Hypervisor>,
    config: BackendConfig,
    gauge: WorkerGauge,
    buses: BTreeMap<DeviceType, Arc<dyn BusOps>>,
}

impl RegistryBuilder {
    /// Registers the driver for `D::DEVICE_TYPE`, replacing any earlier one.
    pub fn driver<D: DeviceDriver>(mut self, driver: D) -> Self {
        let bus: Arc<dyn BusOps> = Bus::new(driver, self.hv.clone(), self.gauge.clone());
        if self.buses.insert(D::DEVICE_TYPE, bus).is_some() {
            warn!(device_type = %D::DEVICE_TYPE, "driver registered twice");
        }
        self
    }

    pub fn build(self) -> DeviceRegistry {
        info!(
            backend_id = self.config.backend_id,
            drivers = ?self.buses.keys().collect::<Vec<_>>(),
            "device registry ready"
        );
        DeviceRegistry {
            config: self.config,
            gauge: self.gauge,
            buses: self.buses,
            next_ids: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }
}

/// Creates, destroys and enumerates device instances.
pub struct DeviceRegistry {
    config: BackendConfig,
    gauge: WorkerGauge,
    buses: BTreeMap<DeviceType, Arc<dyn BusOps>>,
    /// Enumeration lock; also holds the next device id per (type, frontend).
    next_ids: Mutex<HashMap<(DeviceType, DomId), DeviceId>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("backend_id", &self.config.backend_id)
            .field("drivers", &self.buses.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    pub fn builder(hv: Arc<dyn Hypervisor>, config: BackendConfig) -> RegistryBuilder {
        RegistryBuilder {
            hv,
            config,
            gauge: WorkerGauge::default(),
            buses: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Gauge counting live notification workers.
    pub fn gauge(&self) -> &WorkerGauge {
        &self.gauge
    }

    pub fn active_workers(&self) -> usize {
        self.gauge.active()
    }

    pub fn device_count(&self) -> usize {
        self.buses.values().map(|bus| bus.len()).sum()
    }

    fn bus(&self, device_type: DeviceType) -> Result<&Arc<dyn BusOps>> {
        self.buses
            .get(&device_type)
            .ok_or(NoxsError::NoDriver(device_type))
    }

    fn check_backend(&self, key: &DeviceKey) -> Result<()> {
        if key.backend_id != self.config.backend_id {
            return Err(NoxsError::InvalidArgument(format!(
                "{key} names backend {}, this is {}",
                key.backend_id, self.config.backend_id
            )));
        }
        Ok(())
    }

    pub fn create(&self, key: DeviceKey, config: &DeviceConfig) -> Result<CommHandle> {
        self.create_with(key, config, CreateOptions::default())
    }

    /// Creates a device and returns what the frontend needs to attach to it.
    ///
    /// The device id in `key` is ignored; the next free id for the frontend is assigned.
    pub fn create_with(
        &self,
        key: DeviceKey,
        config: &DeviceConfig,
        options: CreateOptions,
    ) -> Result<CommHandle> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(NoxsError::InvalidArgument("backend is shutting down".into()));
        }
        self.check_backend(&key)?;
        if key.device_type != config.device_type() {
            return Err(NoxsError::InvalidArgument(format!(
                "{} config for a {} key",
                config.device_type(),
                key.device_type
            )));
        }
        let bus = self.bus(key.device_type)?;

        let mut next_ids = lock(&self.next_ids);
        let next = next_ids
            .entry((key.device_type, key.frontend_id))
            .or_insert(0);
        if *next == DEVICE_ID_ANY {
            return Err(NoxsError::ResourceExhausted(format!(
                "{} device ids for domain {}",
                key.device_type, key.frontend_id
            )));
        }
        let key = key.with_device_id(*next);
        let handle = bus.create(key, config, options.online)?;
        *next += 1;
        Ok(handle)
    }

    /// Unregisters every device `selector` matches and returns how many were removed.
    ///
    /// Nothing is removed if any matching device still has I/O in flight.
    pub fn destroy(&self, selector: &DeviceKey) -> Result<usize> {
        if selector.backend_id != self.config.backend_id {
            debug!(%selector, "destroy for foreign backend matches nothing");
            return Ok(0);
        }
        let Some(bus) = self.buses.get(&selector.device_type) else {
            debug!(%selector, "destroy for a device type without a driver matches nothing");
            return Ok(0);
        };
        let _enumeration = lock(&self.next_ids);

        for key in bus.matching(selector) {
            let busy = bus.lookup(&key).map_or(0, |dev| dev.inflight());
            if busy > 0 {
                return Err(NoxsError::Busy(format!("{key} has {busy} requests in flight")));
            }
        }

        let mut removed = 0;
        loop {
            let keys = bus.matching(selector);
            if keys.is_empty() {
                break;
            }
            for key in &keys {
                if bus.unregister(key) {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(%selector, removed, "devices destroyed");
        }
        Ok(removed)
    }

    /// Lists device ids of `key.device_type` for `key.frontend_id`, at most `capacity` of them.
    pub fn list(&self, key: &DeviceKey, capacity: usize) -> Result<DeviceList> {
        if capacity > DEV_COUNT_MAX {
            return Err(NoxsError::protocol(format!(
                "list capacity {capacity} exceeds {DEV_COUNT_MAX}"
            )));
        }
        let bus = self.bus(key.device_type)?;
        let _enumeration = lock(&self.next_ids);

        let mut ids: Vec<DeviceId> = bus
            .frontend_devices(key.frontend_id)
            .into_iter()
            .map(|k| k.device_id)
            .collect();
        ids.sort_unstable();
        let truncated = ids.len() > capacity;
        ids.truncate(capacity);
        Ok(DeviceList { ids, truncated })
    }

    /// Asks a guest to shut down through its system-control device.
    ///
    /// Returns `false` without doing anything unless the domain has exactly one such device.
    pub fn guest_close(&self, domain: DomId, reason: GuestCloseReason) -> Result<bool> {
        let _enumeration = lock(&self.next_ids);
        let keys = self
            .buses
            .get(&DeviceType::Sysctl)
            .map(|bus| bus.frontend_devices(domain))
            .unwrap_or_default();
        let [key] = keys.as_slice() else {
            debug!(domain, found = keys.len(), "no unique sysctl device, ignoring guest close");
            return Ok(false);
        };
        info!(domain, ?reason, "closing guest");
        self.bus(DeviceType::Sysctl)?
            .driver_cmd(key, DriverCommand::GuestClose(reason))?;
        Ok(true)
    }

    pub fn lookup(&self, key: &DeviceKey) -> Option<Arc<Device>> {
        self.buses.get(&key.device_type)?.lookup(key)
    }

    pub fn set_online(&self, key: &DeviceKey, online: bool) -> Result<()> {
        let dev = self
            .lookup(key)
            .ok_or_else(|| NoxsError::InvalidArgument(format!("{key} is not registered")))?;
        dev.set_online(online);
        Ok(())
    }

    pub fn suspend_all(&self) {
        let _enumeration = lock(&self.next_ids);
        for bus in self.buses.values() {
            bus.suspend_all();
        }
    }

    pub fn resume_all(&self) {
        let _enumeration = lock(&self.next_ids);
        for bus in self.buses.values() {
            bus.resume_all();
        }
    }

    /// Closes connected devices, waiting up to the configured timeout for their frontends, then
    /// unregisters everything. Returns how many frontends did not close in time.
    pub fn shutdown(&self) -> usize {
        self.shutdown_within(self.config.shutdown_timeout)
    }

    pub fn shutdown_within(&self, timeout: Duration) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let _enumeration = lock(&self.next_ids);
        let deadline = Instant::now() + timeout;
        let stuck: usize = self
            .buses
            .values()
            .map(|bus| bus.shutdown(deadline.saturating_duration_since(Instant::now())))
            .sum();
        info!(stuck, "registry shut down");
        stuck
    }
}
