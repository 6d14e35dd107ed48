use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use noxs_abi::{
    DeviceConfig, DeviceKey, DeviceType, VifConfig, XenbusState, DEVICE_ID_ANY,
};
use noxs_bus::sim::{SimFrontend, SimHypervisor};
use noxs_bus::{
    BackendConfig, CreateOptions, Device, DeviceDriver, DeviceRegistry, NoxsError, Result,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct LinkDriver {
    connects: Arc<AtomicUsize>,
    removes: Arc<AtomicUsize>,
}

impl DeviceDriver for LinkDriver {
    type Backend = bool;
    const DEVICE_TYPE: DeviceType = DeviceType::Vif;

    fn probe(&self, dev: &Device, _config: &DeviceConfig) -> Result<bool> {
        dev.switch_state(XenbusState::InitWait)?;
        Ok(false)
    }

    fn connect(&self, _dev: &Device, linked: &mut bool) -> Result<()> {
        *linked = true;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self, _dev: &Device, linked: &mut bool) -> Result<()> {
        *linked = false;
        Ok(())
    }

    fn remove(&self, _dev: &Device, _linked: bool) {
        self.removes.fetch_add(1, Ordering::SeqCst);
    }
}

fn vif_config() -> DeviceConfig {
    DeviceConfig::Vif(VifConfig::new([0x00, 0x16, 0x3e, 0x00, 0x00, 0x01]))
}

fn vif_key(frontend: u16) -> DeviceKey {
    DeviceKey::new(DeviceType::Vif, 0, frontend, DEVICE_ID_ANY)
}

fn setup() -> (SimHypervisor, LinkDriver, DeviceRegistry) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let sim = SimHypervisor::new();
    let driver = LinkDriver::default();
    let config = BackendConfig::default().with_timeouts(WAIT, Duration::from_millis(200));
    let registry = DeviceRegistry::builder(sim.domain(0), config)
        .driver(driver.clone())
        .build();
    (sim, driver, registry)
}

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn ids_are_assigned_per_frontend_and_listed_ascending() {
    let (_sim, _driver, registry) = setup();
    for _ in 0..3 {
        registry.create(vif_key(1), &vif_config()).unwrap();
    }
    let other = registry.create(vif_key(2), &vif_config()).unwrap();
    assert_eq!(other.device_id, 0);

    let listed = registry.list(&vif_key(1), 32).unwrap();
    assert_eq!(listed.ids, vec![0, 1, 2]);
    assert!(!listed.truncated);

    let listed = registry.list(&vif_key(1), 2).unwrap();
    assert_eq!(listed.ids, vec![0, 1]);
    assert!(listed.truncated);

    assert!(registry
        .list(&vif_key(1), 33)
        .unwrap_err()
        .is_protocol_violation());
}

#[test]
fn create_rejects_bad_requests() {
    let (_sim, _driver, registry) = setup();

    let console = DeviceKey::new(DeviceType::Console, 0, 1, 0);
    assert_eq!(
        registry.create(console, &DeviceConfig::Console),
        Err(NoxsError::NoDriver(DeviceType::Console))
    );
    assert!(matches!(
        registry.create(vif_key(1), &DeviceConfig::Sysctl),
        Err(NoxsError::InvalidArgument(_))
    ));
    assert!(matches!(
        registry.create(DeviceKey::new(DeviceType::Vif, 7, 1, 0), &vif_config()),
        Err(NoxsError::InvalidArgument(_))
    ));
    assert_eq!(registry.device_count(), 0);
}

#[test]
fn create_then_destroy_leaves_nothing_behind() {
    let (sim, driver, registry) = setup();
    let handle = registry.create(vif_key(3), &vif_config()).unwrap();
    assert_eq!(sim.grant_remote(handle.grant), Some(3));
    assert_eq!(registry.active_workers(), 1);

    let removed = registry
        .destroy(&DeviceKey::new(DeviceType::Vif, 0, 3, handle.device_id))
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(driver.removes.load(Ordering::SeqCst), 1);
    assert!(registry.gauge().wait_idle(WAIT));
    assert!(sim.stats(0).is_empty(), "{:?}", sim.stats(0));

    // Idempotent.
    assert_eq!(registry.destroy(&vif_key(3)).unwrap(), 0);
}

#[test]
fn destroy_scope_follows_the_device_id() {
    let (_sim, _driver, registry) = setup();
    for _ in 0..3 {
        registry.create(vif_key(4), &vif_config()).unwrap();
    }
    registry.create(vif_key(5), &vif_config()).unwrap();

    let exact = DeviceKey::new(DeviceType::Vif, 0, 4, 1);
    assert_eq!(registry.destroy(&exact).unwrap(), 1);
    assert_eq!(registry.list(&vif_key(4), 32).unwrap().ids, vec![0, 2]);

    let foreign = DeviceKey::new(DeviceType::Vif, 9, 4, DEVICE_ID_ANY);
    assert_eq!(registry.destroy(&foreign).unwrap(), 0);

    // No console driver is registered, so nothing can match.
    let console = DeviceKey::new(DeviceType::Console, 0, 4, DEVICE_ID_ANY);
    assert_eq!(registry.destroy(&console), Ok(0));

    assert_eq!(registry.destroy(&vif_key(4)).unwrap(), 2);
    assert_eq!(registry.device_count(), 1);
}

#[test]
fn destroy_refuses_devices_with_io_in_flight() {
    let (_sim, _driver, registry) = setup();
    let handle = registry.create(vif_key(6), &vif_config()).unwrap();
    let key = DeviceKey::new(DeviceType::Vif, 0, 6, handle.device_id);

    let dev = registry.lookup(&key).unwrap();
    let io = dev.begin_io();
    assert!(matches!(registry.destroy(&vif_key(6)), Err(NoxsError::Busy(_))));
    assert!(registry.lookup(&key).is_some());

    drop(io);
    assert_eq!(registry.destroy(&vif_key(6)).unwrap(), 1);
}

#[test]
fn frontend_drives_the_connection() {
    let (sim, driver, registry) = setup();
    let handle = registry.create(vif_key(7), &vif_config()).unwrap();
    let fe = SimFrontend::attach(sim.domain(7), 0, handle, DeviceType::Vif).unwrap();
    assert_eq!(fe.backend_state().unwrap(), XenbusState::InitWait);

    fe.set_state(XenbusState::Initialised).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Connected, WAIT));
    assert_eq!(driver.connects.load(Ordering::SeqCst), 1);

    // Online devices stay registered across a frontend close and reconnect.
    fe.set_state(XenbusState::Closed).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Closed, WAIT));
    let key = DeviceKey::new(DeviceType::Vif, 0, 7, handle.device_id);
    assert!(registry.lookup(&key).is_some());

    fe.set_state(XenbusState::Initialising).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::InitWait, WAIT));
    fe.set_state(XenbusState::Connected).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Connected, WAIT));
    assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn offline_device_unregisters_when_the_frontend_closes() {
    let (sim, driver, registry) = setup();
    let handle = registry
        .create_with(vif_key(8), &vif_config(), CreateOptions { online: false })
        .unwrap();
    let key = DeviceKey::new(DeviceType::Vif, 0, 8, handle.device_id);
    let fe = SimFrontend::attach(sim.domain(8), 0, handle, DeviceType::Vif).unwrap();

    fe.set_state(XenbusState::Connected).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Connected, WAIT));
    fe.set_state(XenbusState::Closed).unwrap();

    assert!(eventually(|| registry.lookup(&key).is_none()));
    assert!(eventually(|| driver.removes.load(Ordering::SeqCst) == 1));
    assert!(registry.gauge().wait_idle(WAIT));

    drop(fe);
    assert!(sim.stats(0).is_empty(), "{:?}", sim.stats(0));
    assert!(sim.stats(8).is_empty(), "{:?}", sim.stats(8));
}

#[test]
fn garbage_frontend_state_closes_the_device() {
    let (sim, _driver, registry) = setup();
    let handle = registry.create(vif_key(9), &vif_config()).unwrap();
    let key = DeviceKey::new(DeviceType::Vif, 0, 9, handle.device_id);
    let fe = SimFrontend::attach(sim.domain(9), 0, handle, DeviceType::Vif).unwrap();

    fe.set_state_raw(77).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Closed, WAIT));
    let dev = registry.lookup(&key).unwrap();
    assert!(dev.last_error().unwrap().is_protocol_violation());
}

#[test]
fn kick_before_first_frontend_state_keeps_the_device() {
    let (sim, driver, registry) = setup();
    let handle = registry.create(vif_key(11), &vif_config()).unwrap();
    let key = DeviceKey::new(DeviceType::Vif, 0, 11, handle.device_id);
    let fe = SimFrontend::attach(sim.domain(11), 0, handle, DeviceType::Vif).unwrap();
    assert_eq!(
        fe.page().frontend_state().unwrap(),
        XenbusState::Initialising
    );

    fe.kick().unwrap();
    fe.set_state(XenbusState::Initialised).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Connected, WAIT));
    assert!(registry.lookup(&key).is_some());
    assert_eq!(driver.removes.load(Ordering::SeqCst), 0);
}

#[test]
fn shutdown_closes_connected_devices() {
    let (sim, _driver, registry) = setup();
    let handle = registry.create(vif_key(10), &vif_config()).unwrap();
    let fe = SimFrontend::attach(sim.domain(10), 0, handle, DeviceType::Vif).unwrap();
    fe.set_state(XenbusState::Connected).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Connected, WAIT));

    // An idle frontend that never answers is abandoned after the timeout.
    registry.create(vif_key(11), &vif_config()).unwrap();

    let responder = thread::spawn(move || {
        assert!(fe.wait_for_backend_state(XenbusState::Closing, WAIT));
        fe.set_state(XenbusState::Closing).unwrap();
        fe
    });
    assert_eq!(registry.shutdown_within(WAIT), 0);
    let fe = responder.join().unwrap();

    assert_eq!(registry.device_count(), 0);
    assert_eq!(fe.backend_state().unwrap(), XenbusState::Closed);
    assert!(registry.create(vif_key(12), &vif_config()).is_err());
}

#[test]
fn shutdown_reports_frontends_that_never_close() {
    let (sim, _driver, registry) = setup();
    let handle = registry.create(vif_key(13), &vif_config()).unwrap();
    let fe = SimFrontend::attach(sim.domain(13), 0, handle, DeviceType::Vif).unwrap();
    fe.set_state(XenbusState::Connected).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Connected, WAIT));

    assert_eq!(registry.shutdown_within(Duration::from_millis(50)), 1);
    assert_eq!(registry.device_count(), 0);
}

#[test]
fn suspend_and_resume_restart_the_handshake() {
    let (sim, driver, registry) = setup();
    let handle = registry.create(vif_key(14), &vif_config()).unwrap();
    let fe = SimFrontend::attach(sim.domain(14), 0, handle, DeviceType::Vif).unwrap();
    fe.set_state(XenbusState::Connected).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Connected, WAIT));

    registry.suspend_all();
    assert_eq!(registry.active_workers(), 0);

    registry.resume_all();
    assert_eq!(registry.active_workers(), 1);
    assert_eq!(fe.backend_state().unwrap(), XenbusState::Initialising);

    fe.set_state(XenbusState::Initialised).unwrap();
    assert!(fe.wait_for_backend_state(XenbusState::Connected, WAIT));
    assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn guest_close_without_sysctl_device_is_a_no_op() {
    let (_sim, _driver, registry) = setup();
    assert_eq!(
        registry.guest_close(3, noxs_bus::GuestCloseReason::Poweroff),
        Ok(false)
    );
}
