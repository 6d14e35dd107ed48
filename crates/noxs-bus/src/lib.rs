//! Backend side of the noxs split-driver control plane.
//!
//! A backend publishes one control page per device instance, grants it to the frontend domain
//! and signals state changes over an event channel. This crate provides:
//!
//! - [`comm`]: the page/grant/event-channel transport and the per-device notification worker,
//! - [`device`] and [`state`]: device objects and the connection state machine,
//! - [`driver`]: the hook trait device types implement,
//! - [`store`] and [`ring`]: queue negotiation and ring mapping,
//! - [`registry`] and [`admin`]: device lifecycle and the privileged command channel,
//! - [`sim`]: an in-memory hypervisor and frontend used by tests and tooling.
//!
//! Hypervisor access goes through the [`Hypervisor`] trait only.

#![forbid(unsafe_code)]

pub mod admin;
mod bus;
pub mod comm;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod hypervisor;
pub mod registry;
pub mod ring;
pub mod sim;
pub mod state;
pub mod store;

pub use admin::{AdminChannel, AdminReply, AdminRequest, AdminResponse, Credentials, Status};
pub use comm::{CommChannel, CommHandle, NotificationEvent, WorkerGauge};
pub use config::{BackendConfig, ConfigError};
pub use device::{Device, IoRef, PeerState};
pub use driver::{DeviceDriver, DriverCommand, GuestCloseReason, Reaction};
pub use error::{NoxsError, Result};
pub use hypervisor::{GuestPage, Hypervisor, HypervisorError, Irq, IrqHandler, MapHandle};
pub use registry::{CreateOptions, DeviceList, DeviceRegistry, RegistryBuilder};
pub use ring::RingBinding;
pub use store::{check_locator, negotiate_queue_count, resolve_queues, QueueLocator, RingStore};
