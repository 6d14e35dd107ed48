use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;
use crate::types::{DeviceId, DeviceKey, DeviceType, DomId};

/// Textual device locator: `<type>-<frontend>-<device>`.
///
/// Multi-queue consumers append `/queue-<n>` via [`BusId::queue`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusId {
    device_type: DeviceType,
    frontend_id: DomId,
    device_id: DeviceId,
}

impl BusId {
    pub fn new(device_type: DeviceType, frontend_id: DomId, device_id: DeviceId) -> Self {
        Self {
            device_type,
            frontend_id,
            device_id,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn frontend_id(&self) -> DomId {
        self.frontend_id
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Locator of queue `index` of this device.
    pub fn queue(&self, index: usize) -> String {
        format!("{self}/queue-{index}")
    }
}

impl From<&DeviceKey> for BusId {
    fn from(key: &DeviceKey) -> Self {
        Self::new(key.device_type, key.frontend_id, key.device_id)
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.device_type, self.frontend_id, self.device_id
        )
    }
}

impl FromStr for BusId {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LayoutError::InvalidBusId(s.to_string());
        let base = match s.split_once('/') {
            Some((base, suffix)) => {
                let index = suffix.strip_prefix("queue-").ok_or_else(invalid)?;
                index.parse::<usize>().map_err(|_| invalid())?;
                base
            }
            None => s,
        };
        let mut parts = base.splitn(3, '-');
        let (Some(ty), Some(fe), Some(dev)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        Ok(Self {
            device_type: ty.parse().map_err(|_| invalid())?,
            frontend_id: fe.parse().map_err(|_| invalid())?,
            device_id: dev.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for BusId {
    type Error = LayoutError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BusId> for String {
    fn from(id: BusId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_and_parses() {
        let key = DeviceKey::new(DeviceType::Vbd, 0, 5, 1);
        let id = BusId::from(&key);
        assert_eq!(id.to_string(), "vbd-5-1");
        assert_eq!(id.queue(3), "vbd-5-1/queue-3");
        assert_eq!("vbd-5-1".parse::<BusId>().unwrap(), id);
        assert_eq!("vbd-5-1/queue-3".parse::<BusId>().unwrap(), id);
    }

    #[test]
    fn rejects_malformed_locators() {
        for bad in [
            "",
            "vbd",
            "vbd-5",
            "disk-5-1",
            "vbd-x-1",
            "vbd-5-",
            "vbd-70000-1",
            "vbd-1-0/garbage",
            "vbd-1-0/queue-",
            "vbd-1-0/queue-x",
            "vbd-1-0/queue-1/queue-2",
        ] {
            assert!(bad.parse::<BusId>().is_err(), "{bad}");
        }
    }
}
