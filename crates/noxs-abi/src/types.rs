use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

/// Numeric domain identifier.
pub type DomId = u16;

/// Per-(type, frontend) device instance number.
pub type DeviceId = u32;

/// Device id wildcard accepted by `destroy`: matches every device of the key's type that
/// belongs to the key's frontend.
pub const DEVICE_ID_ANY: DeviceId = u32::MAX;

/// Grant table reference authorizing a remote domain to map one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantRef(pub u32);

impl GrantRef {
    /// Reference value never handed out by a grant table.
    pub const INVALID: GrantRef = GrantRef(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for GrantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gref:{}", self.0)
    }
}

/// Local event channel port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvtchnPort(pub u32);

impl EvtchnPort {
    /// Port 0 is reserved by the hypervisor and never bound.
    pub const INVALID: EvtchnPort = EvtchnPort(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for EvtchnPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port:{}", self.0)
    }
}

/// Split-driver device class.
///
/// The numeric values are stored in the control page header and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum DeviceType {
    Sysctl = 1,
    Console = 2,
    Vif = 3,
    Vbd = 4,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::Sysctl,
        DeviceType::Console,
        DeviceType::Vif,
        DeviceType::Vbd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Sysctl => "sysctl",
            DeviceType::Console => "console",
            DeviceType::Vif => "vif",
            DeviceType::Vbd => "vbd",
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for DeviceType {
    type Error = LayoutError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            1 => DeviceType::Sysctl,
            2 => DeviceType::Console,
            3 => DeviceType::Vif,
            4 => DeviceType::Vbd,
            other => return Err(LayoutError::UnknownDeviceType(other)),
        })
    }
}

impl FromStr for DeviceType {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| LayoutError::InvalidBusId(s.to_string()))
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state published by each end in the control page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum XenbusState {
    Unknown = 0,
    Initialising = 1,
    /// Waiting for the peer to publish its details.
    InitWait = 2,
    Initialised = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
    Reconfiguring = 7,
    Reconfigured = 8,
}

impl XenbusState {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            XenbusState::Unknown => "Unknown",
            XenbusState::Initialising => "Initialising",
            XenbusState::InitWait => "InitWait",
            XenbusState::Initialised => "Initialised",
            XenbusState::Connected => "Connected",
            XenbusState::Closing => "Closing",
            XenbusState::Closed => "Closed",
            XenbusState::Reconfiguring => "Reconfiguring",
            XenbusState::Reconfigured => "Reconfigured",
        }
    }
}

impl TryFrom<u32> for XenbusState {
    type Error = LayoutError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => XenbusState::Unknown,
            1 => XenbusState::Initialising,
            2 => XenbusState::InitWait,
            3 => XenbusState::Initialised,
            4 => XenbusState::Connected,
            5 => XenbusState::Closing,
            6 => XenbusState::Closed,
            7 => XenbusState::Reconfiguring,
            8 => XenbusState::Reconfigured,
            other => return Err(LayoutError::InvalidState(other)),
        })
    }
}

impl fmt::Display for XenbusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-direction watch readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum WatchState {
    /// Notifications are not being consumed.
    #[default]
    None = 0,
    /// A notification worker is armed but has not consumed anything yet.
    Requested = 1,
    /// At least one notification has been consumed.
    Updated = 2,
}

impl WatchState {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for WatchState {
    type Error = LayoutError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => WatchState::None,
            1 => WatchState::Requested,
            2 => WatchState::Updated,
            other => return Err(LayoutError::InvalidWatchState(other)),
        })
    }
}

/// Backend-side identity of one device instance.
///
/// Field order matters: the derived `Ord` groups keys by type, then backend, then frontend,
/// which is the order registry scans and listings use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub device_type: DeviceType,
    pub backend_id: DomId,
    pub frontend_id: DomId,
    pub device_id: DeviceId,
}

impl DeviceKey {
    pub fn new(
        device_type: DeviceType,
        backend_id: DomId,
        frontend_id: DomId,
        device_id: DeviceId,
    ) -> Self {
        Self {
            device_type,
            backend_id,
            frontend_id,
            device_id,
        }
    }

    /// Same key with a different device id.
    pub fn with_device_id(self, device_id: DeviceId) -> Self {
        Self { device_id, ..self }
    }

    pub fn is_wildcard(&self) -> bool {
        self.device_id == DEVICE_ID_ANY
    }

    /// Whether `other` names the same device class on the same backend/frontend pair.
    pub fn same_frontend(&self, other: &DeviceKey) -> bool {
        self.device_type == other.device_type
            && self.backend_id == other.backend_id
            && self.frontend_id == other.frontend_id
    }

    /// Match used by `destroy`: a wildcard device id selects every device for the frontend.
    pub fn selects(&self, candidate: &DeviceKey) -> bool {
        self.same_frontend(candidate)
            && (self.is_wildcard() || self.device_id == candidate.device_id)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[be={} fe={} id={}]",
            self.device_type, self.backend_id, self.frontend_id, self.device_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_values_match_wire_encoding() {
        for raw in 0..=8u32 {
            let state = XenbusState::try_from(raw).unwrap();
            assert_eq!(state.as_u32(), raw);
        }
        assert_eq!(XenbusState::try_from(9), Err(LayoutError::InvalidState(9)));
    }

    #[test]
    fn device_type_names_round_trip() {
        for ty in DeviceType::ALL {
            assert_eq!(ty.as_str().parse::<DeviceType>().unwrap(), ty);
            assert_eq!(DeviceType::try_from(ty.as_u32()).unwrap(), ty);
        }
        assert!(DeviceType::try_from(0).is_err());
        assert!("none".parse::<DeviceType>().is_err());
    }

    #[test]
    fn wildcard_key_selects_every_device_of_the_frontend() {
        let wildcard = DeviceKey::new(DeviceType::Vbd, 0, 5, DEVICE_ID_ANY);
        let exact = wildcard.with_device_id(1);

        let dev0 = DeviceKey::new(DeviceType::Vbd, 0, 5, 0);
        let dev1 = DeviceKey::new(DeviceType::Vbd, 0, 5, 1);
        let other_fe = DeviceKey::new(DeviceType::Vbd, 0, 6, 1);
        let other_type = DeviceKey::new(DeviceType::Vif, 0, 5, 1);

        assert!(wildcard.selects(&dev0));
        assert!(wildcard.selects(&dev1));
        assert!(!wildcard.selects(&other_fe));
        assert!(!wildcard.selects(&other_type));

        assert!(!exact.selects(&dev0));
        assert!(exact.selects(&dev1));
    }

    #[test]
    fn key_serializes_with_lowercase_type() {
        let key = DeviceKey::new(DeviceType::Vif, 0, 3, 2);
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("\"vif\""), "{json}");
        let back: DeviceKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
