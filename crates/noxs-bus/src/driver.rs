use noxs_abi::{DeviceConfig, DeviceType};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::{Device, PeerState};
use crate::error::{NoxsError, Result};
use crate::state;

/// What the bus should do after a peer-state notification was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Keep the device registered.
    None,
    /// Remove the device from the registry and release it.
    Unregister,
}

/// Why the toolstack wants a guest to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestCloseReason {
    Poweroff,
    Suspend,
}

/// Administrative commands forwarded to a device's driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCommand {
    GuestClose(GuestCloseReason),
}

/// Per-device-type hooks driven by the bus.
///
/// Hooks run either on the administrative path (`probe`, `remove`, `driver_cmd`) or on the
/// device's notification worker (`otherend_changed` and the `connect`/`disconnect` calls it
/// makes). Hooks that receive the payload are serialized per device by the payload lock.
/// `driver_cmd` takes no payload and may run while the worker is inside `otherend_changed`.
pub trait DeviceDriver: Send + Sync + 'static {
    /// Device-type payload owned by the bus alongside each device.
    type Backend: Send + 'static;

    const DEVICE_TYPE: DeviceType;

    /// Builds the payload, publishes backend details and switches the device to `InitWait`.
    fn probe(&self, dev: &Device, config: &DeviceConfig) -> Result<Self::Backend>;

    /// Negotiates and maps rings after the frontend published its details.
    fn connect(&self, dev: &Device, backend: &mut Self::Backend) -> Result<()>;

    /// Releases any ring binding. Must be idempotent.
    fn disconnect(&self, dev: &Device, backend: &mut Self::Backend) -> Result<()>;

    /// Final cleanup before the transport is torn down.
    fn remove(&self, dev: &Device, mut backend: Self::Backend) {
        if let Err(err) = self.disconnect(dev, &mut backend) {
            warn!(bus_id = %dev.bus_id(), error = %err, "disconnect during remove failed");
        }
    }

    /// Reacts to a new frontend state.
    fn otherend_changed(
        &self,
        dev: &Device,
        backend: &mut Self::Backend,
        peer: PeerState,
    ) -> Reaction {
        state::frontend_changed(self, dev, backend, peer)
    }

    fn suspend(&self, _dev: &Device, _backend: &mut Self::Backend) -> Result<()> {
        Ok(())
    }

    fn resume(&self, _dev: &Device, _backend: &mut Self::Backend) -> Result<()> {
        Ok(())
    }

    /// Runs on the caller's thread, concurrently with notification handling for `dev`.
    fn driver_cmd(&self, _dev: &Device, cmd: DriverCommand) -> Result<()> {
        Err(NoxsError::Unsupported(format!(
            "{cmd:?} on {} devices",
            Self::DEVICE_TYPE
        )))
    }
}
