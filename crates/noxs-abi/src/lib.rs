//! Shared-page ABI for noxs split device drivers.
//!
//! Backends and frontends exchange configuration through a single granted page per device
//! instance instead of a hierarchical key/value store. This crate owns everything both sides
//! must agree on byte-for-byte:
//!
//! - [`layout`]: field offsets inside the control page,
//! - [`page`]: validating typed views over a page's words,
//! - [`types`]: identifiers, connection states and device keys,
//! - [`config`]: per-device-type creation parameters,
//! - [`bus_id`]: the textual device locator.
//!
//! Nothing in here talks to a hypervisor; see `noxs-bus` for the transport.

#![forbid(unsafe_code)]

pub mod bus_id;
pub mod config;
pub mod error;
pub mod features;
pub mod layout;
pub mod page;
pub mod types;

pub use bus_id::BusId;
pub use config::{DeviceConfig, VbdConfig, VifConfig};
pub use error::{LayoutError, Result};
pub use features::{SysctlCommand, VbdFeatures, VifFeatures};
pub use page::{
    ControlPage, PageMemory, QueueSlot, SysctlPage, VbdPage, VifPage, VifQueueRecord,
};
pub use types::{
    DeviceId, DeviceKey, DeviceType, DomId, EvtchnPort, GrantRef, WatchState, XenbusState,
    DEVICE_ID_ANY,
};
