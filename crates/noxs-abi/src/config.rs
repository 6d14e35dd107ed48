use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::types::DeviceType;

/// Creation parameters for one device instance, tagged by device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceConfig {
    Sysctl,
    Console,
    Vif(VifConfig),
    Vbd(VbdConfig),
}

impl DeviceConfig {
    pub fn device_type(&self) -> DeviceType {
        match self {
            DeviceConfig::Sysctl => DeviceType::Sysctl,
            DeviceConfig::Console => DeviceType::Console,
            DeviceConfig::Vif(_) => DeviceType::Vif,
            DeviceConfig::Vbd(_) => DeviceType::Vbd,
        }
    }
}

fn default_queues() -> u32 {
    1
}

fn default_sector_size() -> u32 {
    512
}

fn yes() -> bool {
    true
}

/// Virtual block device parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbdConfig {
    /// Queues the frontend is expected to request; validated against the backend maximum.
    #[serde(default = "default_queues")]
    pub num_queues: u32,
    pub sectors: u64,
    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
    #[serde(default = "default_sector_size")]
    pub physical_sector_size: u32,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default = "yes")]
    pub flush: bool,
    #[serde(default = "yes")]
    pub persistent: bool,
    #[serde(default)]
    pub discard: bool,
}

impl VbdConfig {
    pub fn new(sectors: u64) -> Self {
        Self {
            num_queues: default_queues(),
            sectors,
            sector_size: default_sector_size(),
            physical_sector_size: default_sector_size(),
            readonly: false,
            flush: true,
            persistent: true,
            discard: false,
        }
    }

    pub fn with_queues(mut self, num_queues: u32) -> Self {
        self.num_queues = num_queues;
        self
    }
}

/// Virtual network interface parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VifConfig {
    #[serde(default = "default_queues")]
    pub num_queues: u32,
    pub mac: [u8; 6],
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub bridge: Option<String>,
}

impl VifConfig {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            num_queues: default_queues(),
            mac,
            ip: None,
            bridge: None,
        }
    }

    pub fn with_queues(mut self, num_queues: u32) -> Self {
        self.num_queues = num_queues;
        self
    }
}
