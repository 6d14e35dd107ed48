//! Connection state machine shared by every device type.
//!
//! Driven only by the frontend state read from the control page on each notification. Device
//! types plug in through [`DeviceDriver::connect`] and [`DeviceDriver::disconnect`]; the
//! transitions themselves are identical for all of them.

use noxs_abi::XenbusState;
use tracing::{debug, info, warn};

use crate::device::{Device, PeerState};
use crate::driver::{DeviceDriver, Reaction};
use crate::error::NoxsError;

/// Default `otherend_changed` behaviour.
pub fn frontend_changed<D: DeviceDriver + ?Sized>(
    driver: &D,
    dev: &Device,
    backend: &mut D::Backend,
    peer: PeerState,
) -> Reaction {
    let local = dev.state();
    debug!(bus_id = %dev.bus_id(), local = %local, peer = %peer, "frontend changed");

    match peer {
        PeerState::Valid(XenbusState::Initialising) => {
            if local == XenbusState::Closed {
                info!(bus_id = %dev.bus_id(), "frontend restarting");
                advance(dev, XenbusState::InitWait);
            }
            Reaction::None
        }

        PeerState::Valid(XenbusState::Initialised | XenbusState::Connected) => {
            // Closing/Closed devices need the frontend to restart through Initialising.
            if !matches!(
                local,
                XenbusState::Connected | XenbusState::Closing | XenbusState::Closed
            ) {
                reconnect(driver, dev, backend);
            }
            Reaction::None
        }

        PeerState::Valid(XenbusState::Closing) => {
            if local < XenbusState::Closing {
                advance(dev, XenbusState::Closing);
            }
            Reaction::None
        }

        PeerState::Valid(XenbusState::Closed) => {
            close(driver, dev, backend);
            if dev.is_online() {
                Reaction::None
            } else {
                Reaction::Unregister
            }
        }

        PeerState::Valid(XenbusState::Unknown) => {
            close(driver, dev, backend);
            Reaction::Unregister
        }

        other => {
            dev.fatal(NoxsError::protocol(format!(
                "unexpected frontend state {other}"
            )));
            Reaction::None
        }
    }
}

fn advance(dev: &Device, state: XenbusState) {
    if let Err(err) = dev.switch_state(state) {
        dev.fatal(err);
    }
}

fn reconnect<D: DeviceDriver + ?Sized>(driver: &D, dev: &Device, backend: &mut D::Backend) {
    if let Err(err) = driver.disconnect(dev, backend) {
        dev.fatal(err);
        return;
    }

    match driver.connect(dev, backend) {
        Ok(()) => {
            advance(dev, XenbusState::Connected);
            info!(bus_id = %dev.bus_id(), "connected");
        }
        Err(err) => {
            if let Err(cleanup) = driver.disconnect(dev, backend) {
                warn!(bus_id = %dev.bus_id(), error = %cleanup, "disconnect after failed connect");
            }
            if err.is_protocol_violation() {
                dev.fatal(err);
            } else {
                warn!(bus_id = %dev.bus_id(), error = %err, "connect failed");
                dev.record_error(err);
            }
        }
    }
}

fn close<D: DeviceDriver + ?Sized>(driver: &D, dev: &Device, backend: &mut D::Backend) {
    if let Err(err) = driver.disconnect(dev, backend) {
        warn!(bus_id = %dev.bus_id(), error = %err, "disconnect on close failed");
        dev.record_error(err);
    }
    dev.force_closed();
}
