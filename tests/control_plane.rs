use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use noxs::abi::{
    DeviceConfig, DeviceKey, DeviceType, VbdConfig, VifConfig, XenbusState, DEVICE_ID_ANY,
};
use noxs::bus::sim::{SimFrontend, SimHypervisor, SimStats};
use noxs::bus::{AdminReply, AdminRequest, AdminResponse, CommHandle, Credentials, Status};
use noxs::{standard_registry, AdminChannel, BackendConfig};
use proptest::prelude::*;

const WAIT: Duration = Duration::from_secs(5);
const BACKEND: u16 = 0;

fn channel() -> (SimHypervisor, AdminChannel) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let sim = SimHypervisor::new();
    let config = BackendConfig::default().with_max_queues(4);
    let registry = standard_registry(sim.domain(BACKEND), config);
    (sim, AdminChannel::new(Arc::new(registry)))
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

fn vbd_key(frontend: u16) -> DeviceKey {
    DeviceKey::new(DeviceType::Vbd, BACKEND, frontend, DEVICE_ID_ANY)
}

/// Sends a request through the JSON form a toolstack would use.
fn call(channel: &AdminChannel, request: &AdminRequest) -> anyhow::Result<AdminReply> {
    let wire = serde_json::to_string(request)?;
    let request: AdminRequest = serde_json::from_str(&wire)?;
    let reply = channel.handle(&Credentials::privileged(), request);
    let wire = serde_json::to_string(&reply)?;
    Ok(serde_json::from_str(&wire)?)
}

fn create(
    channel: &AdminChannel,
    frontend: u16,
    config: DeviceConfig,
    online: bool,
) -> anyhow::Result<CommHandle> {
    let key = DeviceKey::new(config.device_type(), BACKEND, frontend, DEVICE_ID_ANY);
    let reply = call(
        channel,
        &AdminRequest::Create {
            key,
            config,
            online,
        },
    )?;
    match reply.payload {
        Some(AdminResponse::Created(handle)) => Ok(handle),
        _ => bail!("create failed: {reply:?}"),
    }
}

fn connect_vbd(
    sim: &SimHypervisor,
    frontend: u16,
    handle: CommHandle,
    queues: u32,
) -> anyhow::Result<SimFrontend> {
    let fe = SimFrontend::attach(sim.domain(frontend), BACKEND, handle, DeviceType::Vbd)?;
    if !fe.wait_for_backend_state(XenbusState::InitWait, WAIT) {
        bail!("backend never reached InitWait");
    }
    fe.publish_vbd_rings(queues, 0)?;
    fe.set_state(XenbusState::Initialised)?;
    if !fe.wait_for_backend_state(XenbusState::Connected, WAIT) {
        bail!("backend never connected");
    }
    Ok(fe)
}

#[test]
fn two_of_four_queues_map_one_grant_and_channel_each() -> anyhow::Result<()> {
    let (sim, channel) = channel();
    let handle = create(
        &channel,
        1,
        DeviceConfig::Vbd(VbdConfig::new(1 << 20).with_queues(2)),
        true,
    )?;
    let idle = sim.stats(BACKEND);

    let _fe = connect_vbd(&sim, 1, handle, 2)?;

    let stats = sim.stats(BACKEND);
    assert_eq!(stats.mappings, 2);
    assert_eq!(stats.ports - idle.ports, 2);
    Ok(())
}

#[test]
fn oversubscribed_queue_request_creates_nothing() -> anyhow::Result<()> {
    let (sim, channel) = channel();
    let reply = call(
        &channel,
        &AdminRequest::Create {
            key: vbd_key(2),
            config: DeviceConfig::Vbd(VbdConfig::new(64).with_queues(8)),
            online: true,
        },
    )?;

    assert_eq!(reply.status, Status::ProtocolViolation);
    assert_eq!(reply.errno, -71);
    assert_eq!(channel.registry().device_count(), 0);
    assert_eq!(sim.stats(BACKEND), SimStats::default());
    assert!(eventually(|| channel.registry().active_workers() == 0));
    Ok(())
}

#[test]
fn zero_queue_configs_create_nothing() -> anyhow::Result<()> {
    let (sim, channel) = channel();
    let configs = [
        DeviceConfig::Vbd(VbdConfig::new(64).with_queues(0)),
        DeviceConfig::Vif(VifConfig::new([0x00, 0x16, 0x3e, 0, 0, 9]).with_queues(0)),
    ];
    for config in configs {
        let key = DeviceKey::new(config.device_type(), BACKEND, 9, DEVICE_ID_ANY);
        let reply = call(
            &channel,
            &AdminRequest::Create {
                key,
                config,
                online: true,
            },
        )?;
        assert_eq!(reply.status, Status::ProtocolViolation);
        let message = reply.message.context("error reply without a message")?;
        assert!(message.contains("0 queues"), "{message}");
        assert!(!message.contains("frontend"), "{message}");
    }

    assert_eq!(channel.registry().device_count(), 0);
    assert_eq!(sim.stats(BACKEND), SimStats::default());
    assert!(eventually(|| channel.registry().active_workers() == 0));
    Ok(())
}

#[test]
fn peer_close_keeps_online_devices_registered() -> anyhow::Result<()> {
    let (sim, channel) = channel();
    let handle = create(&channel, 3, DeviceConfig::Vbd(VbdConfig::new(64)), true)?;
    let fe = connect_vbd(&sim, 3, handle, 1)?;
    let key = DeviceKey::new(DeviceType::Vbd, BACKEND, 3, handle.device_id);

    fe.set_state(XenbusState::Closed)?;
    assert!(fe.wait_for_backend_state(XenbusState::Closed, WAIT));
    let dev = channel.registry().lookup(&key).context("online device was unregistered")?;
    assert!(eventually(|| sim.stats(BACKEND).mappings == 0));
    assert!(dev.is_online());
    Ok(())
}

#[test]
fn peer_close_unregisters_offline_devices() -> anyhow::Result<()> {
    let (sim, channel) = channel();
    let handle = create(&channel, 4, DeviceConfig::Vbd(VbdConfig::new(64)), false)?;
    let fe = connect_vbd(&sim, 4, handle, 1)?;
    let key = DeviceKey::new(DeviceType::Vbd, BACKEND, 4, handle.device_id);

    fe.set_state(XenbusState::Closed)?;
    assert!(eventually(|| channel.registry().lookup(&key).is_none()));
    assert!(eventually(|| channel.registry().active_workers() == 0));

    fe.release();
    assert!(eventually(|| sim.stats(BACKEND) == SimStats::default()));
    Ok(())
}

#[test]
fn destroy_releases_everything_a_connected_device_held() -> anyhow::Result<()> {
    let (sim, channel) = channel();
    let handle = create(&channel, 5, DeviceConfig::Vbd(VbdConfig::new(64)), true)?;
    let fe = connect_vbd(&sim, 5, handle, 1)?;

    let reply = call(&channel, &AdminRequest::Destroy { key: vbd_key(5) })?;
    assert_eq!(
        reply.payload,
        Some(AdminResponse::Destroyed { removed: 1 })
    );
    assert_eq!(channel.registry().device_count(), 0);
    assert!(eventually(|| channel.registry().active_workers() == 0));

    // The frontend still maps the control page until it lets go.
    assert_eq!(sim.stats(BACKEND).mappings, 0);
    fe.release();
    assert!(eventually(|| sim.stats(BACKEND) == SimStats::default()));
    Ok(())
}

#[test]
fn list_reports_truncation() -> anyhow::Result<()> {
    let (_sim, channel) = channel();
    for _ in 0..3 {
        create(&channel, 6, DeviceConfig::Sysctl, true)?;
    }
    let key = DeviceKey::new(DeviceType::Sysctl, BACKEND, 6, DEVICE_ID_ANY);

    let reply = call(
        &channel,
        &AdminRequest::List {
            key,
            capacity: Some(2),
        },
    )?;
    let Some(AdminResponse::Listed(list)) = reply.payload else {
        bail!("unexpected reply {reply:?}");
    };
    assert_eq!(list.ids, vec![0, 1]);
    assert!(list.truncated);

    let reply = call(&channel, &AdminRequest::List { key, capacity: None })?;
    let Some(AdminResponse::Listed(list)) = reply.payload else {
        bail!("unexpected reply {reply:?}");
    };
    assert_eq!(list.ids, vec![0, 1, 2]);
    assert!(!list.truncated);
    Ok(())
}

#[test]
fn unprivileged_callers_are_refused() {
    let (_sim, channel) = channel();
    let reply = channel.handle(
        &Credentials::unprivileged(),
        AdminRequest::Destroy { key: vbd_key(7) },
    );
    assert_eq!(reply.status, Status::PermissionDenied);
    assert_eq!(reply.errno, -1);
    assert!(reply.payload.is_none());
}

#[test]
fn reply_json_carries_status_and_errno() -> anyhow::Result<()> {
    let (_sim, channel) = channel();
    let reply = channel.handle(
        &Credentials::privileged(),
        AdminRequest::Create {
            key: DeviceKey::new(DeviceType::Console, BACKEND, 8, DEVICE_ID_ANY),
            config: DeviceConfig::Console,
            online: true,
        },
    );
    let json: serde_json::Value = serde_json::to_value(&reply)?;
    assert_eq!(json["status"], "invalid_argument");
    assert_eq!(json["errno"], -22);
    assert!(json.get("payload").is_none());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn create_destroy_sequences_leave_no_residue(
        ops in proptest::collection::vec((1u16..4, any::<bool>()), 1..12)
    ) {
        let (sim, channel) = channel();
        let registry = channel.registry();
        for (frontend, destroy) in ops {
            let key = DeviceKey::new(DeviceType::Sysctl, BACKEND, frontend, DEVICE_ID_ANY);
            if destroy {
                registry.destroy(&key).unwrap();
                prop_assert!(registry.list(&key, 16).unwrap().ids.is_empty());
            } else {
                registry.create(key, &DeviceConfig::Sysctl).unwrap();
            }
        }
        for frontend in 1u16..4 {
            let key = DeviceKey::new(DeviceType::Sysctl, BACKEND, frontend, DEVICE_ID_ANY);
            registry.destroy(&key).unwrap();
        }
        prop_assert_eq!(registry.device_count(), 0);
        prop_assert!(eventually(|| registry.active_workers() == 0));
        prop_assert_eq!(sim.stats(BACKEND), SimStats::default());
    }
}
