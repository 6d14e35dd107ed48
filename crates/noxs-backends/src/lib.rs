//! Device-type drivers for the noxs backend: block ([`blkback`]), network ([`netback`]) and
//! system control ([`sysctlback`]).

#![forbid(unsafe_code)]

pub mod blkback;
pub mod netback;
pub mod sysctlback;

use std::sync::Arc;

use noxs_bus::{BackendConfig, DeviceRegistry, Hypervisor};

pub use blkback::{BlkBackend, BlkProtocol, BlkbackDriver};
pub use netback::{NetBackend, NetbackDriver};
pub use sysctlback::SysctlbackDriver;

/// Registry with every built-in driver registered.
pub fn standard_registry(hv: Arc<dyn Hypervisor>, config: BackendConfig) -> DeviceRegistry {
    let blk = BlkbackDriver::new(&config);
    let net = NetbackDriver::new(&config);
    let sysctl = SysctlbackDriver::new(&config);
    DeviceRegistry::builder(hv, config)
        .driver(sysctl)
        .driver(net)
        .driver(blk)
        .build()
}
