use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Block device capability bits (`vbd::BE_FEATURES` / `vbd::FE_FEATURES`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct VbdFeatures: u32 {
        const FLUSH_CACHE = 1 << 0;
        const BARRIER = 1 << 1;
        const DISCARD = 1 << 2;
        const PERSISTENT = 1 << 3;
        const INDIRECT = 1 << 4;
        const READONLY = 1 << 5;
        const SECURE_DISCARD = 1 << 6;
    }
}

bitflags! {
    /// Network device capability bits (`vif::BE_FEATURES` / `vif::FE_FEATURES`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct VifFeatures: u32 {
        const SG = 1 << 0;
        const GSO_TCPV4 = 1 << 1;
        const GSO_TCPV4_PREFIX = 1 << 2;
        const GSO_TCPV6 = 1 << 3;
        const GSO_TCPV6_PREFIX = 1 << 4;
        const NO_CSUM_OFFLOAD = 1 << 5;
        const IPV6_CSUM_OFFLOAD = 1 << 6;
        const RX_COPY = 1 << 7;
        const RX_NOTIFY = 1 << 8;
        const SPLIT_EVENT_CHANNELS = 1 << 9;
        const MULTICAST_CONTROL = 1 << 10;
        const CTRL_RING = 1 << 11;
    }
}

bitflags! {
    /// Administrative commands the backend posts to a system-control frontend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SysctlCommand: u32 {
        const POWEROFF = 1 << 0;
        const SUSPEND = 1 << 1;
    }
}
