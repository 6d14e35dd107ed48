//! System-control backend.
//!
//! Carries no rings. Its only job is forwarding power commands from the toolstack: the command
//! bits are written to the page, the guest is kicked, and the call blocks until the guest
//! acknowledges by closing its side.

use std::time::Duration;

use noxs_abi::{DeviceConfig, DeviceType, SysctlCommand, XenbusState};
use noxs_bus::{
    BackendConfig, Device, DeviceDriver, DriverCommand, GuestCloseReason, NoxsError, Result,
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SysctlbackDriver {
    ack_timeout: Duration,
}

impl SysctlbackDriver {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            ack_timeout: config.guest_close_timeout,
        }
    }
}

impl DeviceDriver for SysctlbackDriver {
    type Backend = ();
    const DEVICE_TYPE: DeviceType = DeviceType::Sysctl;

    fn probe(&self, dev: &Device, config: &DeviceConfig) -> Result<()> {
        if !matches!(config, DeviceConfig::Sysctl) {
            return Err(NoxsError::InvalidArgument(format!(
                "{} config for a sysctl device",
                config.device_type()
            )));
        }
        dev.page().sysctl()?.set_command(SysctlCommand::empty())?;
        dev.switch_state(XenbusState::InitWait)
    }

    fn connect(&self, _dev: &Device, _backend: &mut ()) -> Result<()> {
        Ok(())
    }

    fn disconnect(&self, _dev: &Device, _backend: &mut ()) -> Result<()> {
        Ok(())
    }

    fn driver_cmd(&self, dev: &Device, cmd: DriverCommand) -> Result<()> {
        let DriverCommand::GuestClose(reason) = cmd;
        let command = match reason {
            GuestCloseReason::Poweroff => SysctlCommand::POWEROFF,
            GuestCloseReason::Suspend => SysctlCommand::SUSPEND,
        };

        let sysctl = dev.page().sysctl()?;
        sysctl.set_command(sysctl.command()? | command)?;
        dev.comm().notify()?;
        info!(bus_id = %dev.bus_id(), ?reason, "guest close requested");

        if dev.wait_for_peer_state(XenbusState::Closed, self.ack_timeout) {
            Ok(())
        } else {
            warn!(bus_id = %dev.bus_id(), ?reason, "guest did not acknowledge close");
            Err(NoxsError::TimedOut(format!(
                "{}: guest did not close within {:?}",
                dev.bus_id(),
                self.ack_timeout
            )))
        }
    }
}
