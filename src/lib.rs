//! noxs: a split-driver control plane for paravirtual devices without a shared key/value store.
//!
//! Each device negotiates through a single granted control page plus one event channel. The
//! pieces live in separate crates:
//!
//! - [`abi`]: control-page layout, device keys and negotiation fields.
//! - [`bus`]: transport, state machine, device registry and the administrative channel.
//! - [`backends`]: the block, network and system-control drivers.

pub use noxs_abi as abi;
pub use noxs_backends as backends;
pub use noxs_bus as bus;

pub use noxs_backends::standard_registry;
pub use noxs_bus::{AdminChannel, BackendConfig, DeviceRegistry, NoxsError};
