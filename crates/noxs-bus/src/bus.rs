//! Per-device-type device index and notification dispatch.
//!
//! One [`Bus`] exists per registered driver. It owns every device of that type together with the
//! driver payload, routes notifications from the device's worker into the driver's hooks, and
//! implements the unregistration sequence shared by administrative and peer-driven removal:
//! remove from the index, stop the watch, run the remove hook, publish `Closed`, tear down the
//! transport. Whoever removes a device from the index performs the release.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use noxs_abi::{DeviceConfig, DeviceKey, DomId, WatchState, XenbusState};
use tracing::{debug, info, warn};

use crate::comm::{lock, CommHandle, NotificationEvent, WorkerGauge};
use crate::device::{Device, PeerState};
use crate::driver::{DeviceDriver, DriverCommand, Reaction};
use crate::error::{NoxsError, Result};
use crate::hypervisor::Hypervisor;

struct BusDevice<D: DeviceDriver> {
    core: Arc<Device>,
    backend: Mutex<Option<D::Backend>>,
}

pub(crate) struct Bus<D: DeviceDriver> {
    driver: D,
    hv: Arc<dyn Hypervisor>,
    gauge: WorkerGauge,
    devices: Mutex<BTreeMap<DeviceKey, Arc<BusDevice<D>>>>,
    shutting_down: AtomicBool,
    this: Weak<Bus<D>>,
}

impl<D: DeviceDriver> Bus<D> {
    pub(crate) fn new(driver: D, hv: Arc<dyn Hypervisor>, gauge: WorkerGauge) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            driver,
            hv,
            gauge,
            devices: Mutex::new(BTreeMap::new()),
            shutting_down: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    fn get(&self, key: &DeviceKey) -> Option<Arc<BusDevice<D>>> {
        lock(&self.devices).get(key).cloned()
    }

    fn arm(&self, dev: &BusDevice<D>) -> Result<()> {
        let bus = self.this.clone();
        let key = *dev.core.key();
        dev.core.watch(&self.gauge, move |event| {
            if let Some(bus) = bus.upgrade() {
                bus.handle_event(&key, event);
            }
        })
    }

    fn handle_event(&self, key: &DeviceKey, event: NotificationEvent) {
        let Some(dev) = self.get(key) else {
            debug!(%key, seq = event.seq, "notification for unregistered device");
            return;
        };
        let core = &dev.core;
        match core.page().backend_watch_state() {
            Ok(WatchState::None) => return,
            Ok(_) => {}
            Err(err) => {
                warn!(bus_id = %core.bus_id(), error = %err, "unreadable watch state");
                return;
            }
        }

        let peer = core.peer_state();
        debug!(bus_id = %core.bus_id(), seq = event.seq, peer = %peer, "otherend changed");
        let reaction = {
            let mut backend = lock(&dev.backend);
            let Some(backend) = backend.as_mut() else {
                return;
            };
            if self.shutting_down.load(Ordering::Acquire) {
                // Only a closing frontend is acted upon while shutting down.
                if peer == PeerState::Valid(XenbusState::Closing) {
                    core.force_closed();
                }
                Reaction::None
            } else {
                self.driver.otherend_changed(core, backend, peer)
            }
        };

        if core.comm().is_watching() {
            if let Err(err) = core.page().set_backend_watch_state(WatchState::Updated) {
                debug!(bus_id = %core.bus_id(), error = %err, "updating watch state failed");
            }
        }
        core.pulse();

        if reaction == Reaction::Unregister {
            info!(bus_id = %core.bus_id(), "frontend gone, unregistering");
            self.remove(key);
        }
    }

    fn remove(&self, key: &DeviceKey) -> bool {
        let removed = lock(&self.devices).remove(key);
        match removed {
            Some(dev) => {
                self.release(&dev);
                true
            }
            None => false,
        }
    }

    fn release(&self, dev: &BusDevice<D>) {
        let core = &dev.core;
        core.comm().free_otherend_watch();
        let backend = lock(&dev.backend).take();
        if let Some(backend) = backend {
            self.driver.remove(core, backend);
        }
        core.force_closed();
        core.teardown();
    }

    fn snapshot(&self) -> Vec<Arc<BusDevice<D>>> {
        lock(&self.devices).values().cloned().collect()
    }
}

impl<D: DeviceDriver> Drop for Bus<D> {
    fn drop(&mut self) {
        let devices = std::mem::take(
            self.devices
                .get_mut()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for dev in devices.values() {
            self.release(dev);
        }
    }
}

/// Type-erased view of a [`Bus`] used by the registry.
///
/// Driver hooks stay statically dispatched inside each bus.
pub(crate) trait BusOps: Send + Sync {
    fn create(&self, key: DeviceKey, config: &DeviceConfig, online: bool) -> Result<CommHandle>;
    fn matching(&self, selector: &DeviceKey) -> Vec<DeviceKey>;
    fn frontend_devices(&self, frontend: DomId) -> Vec<DeviceKey>;
    fn lookup(&self, key: &DeviceKey) -> Option<Arc<Device>>;
    fn unregister(&self, key: &DeviceKey) -> bool;
    fn driver_cmd(&self, key: &DeviceKey, cmd: DriverCommand) -> Result<()>;
    fn suspend_all(&self);
    fn resume_all(&self);
    fn shutdown(&self, timeout: Duration) -> usize;
    fn len(&self) -> usize;
}

impl<D: DeviceDriver> BusOps for Bus<D> {
    fn create(&self, key: DeviceKey, config: &DeviceConfig, online: bool) -> Result<CommHandle> {
        if config.device_type() != D::DEVICE_TYPE {
            return Err(NoxsError::InvalidArgument(format!(
                "{} config for a {} device",
                config.device_type(),
                D::DEVICE_TYPE
            )));
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(NoxsError::InvalidArgument("backend is shutting down".into()));
        }

        let core = Device::initialize(self.hv.clone(), key, online)?;
        let backend = match self.driver.probe(&core, config) {
            Ok(backend) => backend,
            Err(err) => {
                warn!(bus_id = %core.bus_id(), error = %err, "probe failed");
                core.force_closed();
                core.teardown();
                return Err(err);
            }
        };
        let dev = Arc::new(BusDevice {
            core: core.clone(),
            backend: Mutex::new(Some(backend)),
        });

        if let Err(err) = self.arm(&dev) {
            self.release(&dev);
            return Err(err);
        }

        let handle = match core.handle() {
            Ok(handle) => handle,
            Err(err) => {
                self.release(&dev);
                return Err(err);
            }
        };

        {
            let mut devices = lock(&self.devices);
            if devices.contains_key(&key) {
                drop(devices);
                self.release(&dev);
                return Err(NoxsError::Internal(format!("{key} already registered")));
            }
            devices.insert(key, dev);
        }

        info!(
            bus_id = %core.bus_id(),
            grant = %handle.grant,
            port = %handle.event_channel,
            "device created"
        );
        Ok(handle)
    }

    fn matching(&self, selector: &DeviceKey) -> Vec<DeviceKey> {
        lock(&self.devices)
            .keys()
            .filter(|key| selector.selects(key))
            .copied()
            .collect()
    }

    fn frontend_devices(&self, frontend: DomId) -> Vec<DeviceKey> {
        lock(&self.devices)
            .keys()
            .filter(|key| key.frontend_id == frontend)
            .copied()
            .collect()
    }

    fn lookup(&self, key: &DeviceKey) -> Option<Arc<Device>> {
        self.get(key).map(|dev| dev.core.clone())
    }

    fn unregister(&self, key: &DeviceKey) -> bool {
        self.remove(key)
    }

    fn driver_cmd(&self, key: &DeviceKey, cmd: DriverCommand) -> Result<()> {
        let dev = self
            .get(key)
            .ok_or_else(|| NoxsError::InvalidArgument(format!("{key} is not registered")))?;
        self.driver.driver_cmd(&dev.core, cmd)
    }

    fn suspend_all(&self) {
        for dev in self.snapshot() {
            dev.core.comm().free_otherend_watch();
            let mut backend = lock(&dev.backend);
            if let Some(backend) = backend.as_mut() {
                if let Err(err) = self.driver.suspend(&dev.core, backend) {
                    warn!(bus_id = %dev.core.bus_id(), error = %err, "suspend failed");
                    dev.core.record_error(err);
                }
            }
        }
    }

    fn resume_all(&self) {
        for dev in self.snapshot() {
            let core = &dev.core;
            if let Err(err) = core.restart() {
                warn!(bus_id = %core.bus_id(), error = %err, "resetting state failed");
            }
            {
                let mut backend = lock(&dev.backend);
                if let Some(backend) = backend.as_mut() {
                    if let Err(err) = self.driver.resume(core, backend) {
                        warn!(bus_id = %core.bus_id(), error = %err, "resume failed");
                        core.record_error(err);
                    }
                }
            }
            if !core.comm().is_watching() {
                if let Err(err) = self.arm(&dev) {
                    warn!(bus_id = %core.bus_id(), error = %err, "re-arming watch failed");
                    core.record_error(err);
                }
            }
        }
    }

    fn shutdown(&self, timeout: Duration) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        let mut stuck = 0;

        for dev in self.snapshot() {
            let core = &dev.core;
            if core.state() != XenbusState::Connected {
                continue;
            }
            if let Err(err) = core.switch_state(XenbusState::Closing) {
                warn!(bus_id = %core.bus_id(), error = %err, "switching to Closing failed");
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !core.wait_for_close(remaining) {
                warn!(bus_id = %core.bus_id(), "timed out waiting for frontend to close");
                stuck += 1;
            }
        }

        let keys: Vec<DeviceKey> = lock(&self.devices).keys().copied().collect();
        for key in &keys {
            self.remove(key);
        }
        stuck
    }

    fn len(&self) -> usize {
        lock(&self.devices).len()
    }
}
