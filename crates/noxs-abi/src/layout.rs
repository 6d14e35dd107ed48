//! Control page layout contract.
//!
//! Every device instance owns one page that the backend allocates and grants to the frontend.
//! The page starts with a fixed header followed by a device-type payload. All values are
//! *byte offsets from the start of the page*; every field is a little-endian `u32` unless noted
//! otherwise (`u64` fields are stored as two words, low word first).
//!
//! Each side writes only its own half of the header (`BE_*` vs `FE_*`). Readers must re-read
//! every field they depend on after each notification since multi-word updates are not atomic.

/// `b"NOXS"` as a little-endian `u32`.
pub const NOXS_MAGIC: u32 = 0x5358_4F4E;

/// Control page ABI version.
pub const NOXS_VERSION: u32 = 1;

/// Size of a control page (and of every granted ring page).
pub const PAGE_SIZE: usize = 4096;

/// Upper bound on queues any backend may advertise.
pub const MAX_QUEUES: usize = 16;

/// Largest ring page order a block frontend may request.
pub const MAX_RING_PAGE_ORDER: u32 = 4;

/// Grant slots in one block ring record (`1 << MAX_RING_PAGE_ORDER`).
pub const MAX_RING_GRANTS: usize = 1 << MAX_RING_PAGE_ORDER;

/// Maximum number of device ids a single `list` call reports.
pub const DEV_COUNT_MAX: usize = 32;

/// Native block ring ABI name advertised to frontends.
#[cfg(target_pointer_width = "32")]
pub const NATIVE_PROTOCOL: &str = "x86_32-abi";
#[cfg(not(target_pointer_width = "32"))]
pub const NATIVE_PROTOCOL: &str = "x86_64-abi";

/// Common header shared by all device types.
///
/// Layout (all little-endian `u32`):
/// - magic, version, device type
/// - backend domain id, device id
/// - control page grant, backend event channel
/// - backend state, frontend state
/// - backend watch state, frontend watch state
///
/// Reserved up to [`header::BYTES`].
pub mod header {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const DEVICE_TYPE: usize = 8;
    pub const DOMAIN_ID: usize = 12;
    pub const DEVICE_ID: usize = 16;
    pub const GRANT: usize = 20;
    pub const EVENT_CHANNEL: usize = 24;
    pub const BE_STATE: usize = 28;
    pub const FE_STATE: usize = 32;
    pub const BE_WATCH_STATE: usize = 36;
    pub const FE_WATCH_STATE: usize = 40;

    pub const BYTES: usize = 64;
}

/// Block device payload.
pub mod vbd {
    use super::header;

    pub const BE_FEATURES: usize = header::BYTES;
    pub const FE_FEATURES: usize = header::BYTES + 4;
    pub const MAX_INDIRECT_SEGMENTS: usize = header::BYTES + 8;
    pub const MAX_QUEUES: usize = header::BYTES + 12;
    pub const NUM_QUEUES: usize = header::BYTES + 16;
    pub const MAX_RING_PAGE_ORDER: usize = header::BYTES + 20;
    pub const RING_PAGE_ORDER: usize = header::BYTES + 24;
    pub const SECTOR_SIZE: usize = header::BYTES + 28;
    pub const PHYSICAL_SECTOR_SIZE: usize = header::BYTES + 32;
    pub const INFO: usize = header::BYTES + 36;
    /// `u64`.
    pub const SECTORS: usize = header::BYTES + 40;
    pub const DISCARD_GRANULARITY: usize = header::BYTES + 48;
    pub const DISCARD_ALIGNMENT: usize = header::BYTES + 52;
    /// NUL-padded ASCII.
    pub const PROTOCOL: usize = header::BYTES + 56;
    pub const PROTOCOL_BYTES: usize = 32;

    /// Ring record: event channel followed by `MAX_RING_GRANTS` grant refs.
    pub mod ring {
        use crate::layout::MAX_RING_GRANTS;

        pub const EVENT_CHANNEL: usize = 0;
        pub const REFS: usize = 4;
        pub const BYTES: usize = 4 + MAX_RING_GRANTS * 4;
    }

    /// Record used when exactly one queue is negotiated.
    pub const INLINE_RING: usize = 192;
    /// First of `MAX_QUEUES` per-queue records.
    pub const QUEUE_RINGS: usize = INLINE_RING + ring::BYTES;

    pub const END: usize = QUEUE_RINGS + super::MAX_QUEUES * ring::BYTES;

    const _: () = assert!(PROTOCOL + PROTOCOL_BYTES <= INLINE_RING);
    const _: () = assert!(END <= super::PAGE_SIZE);
}

/// Network device payload.
pub mod vif {
    use super::header;

    pub const BE_FEATURES: usize = header::BYTES;
    pub const FE_FEATURES: usize = header::BYTES + 4;
    pub const MAX_QUEUES: usize = header::BYTES + 8;
    pub const NUM_QUEUES: usize = header::BYTES + 12;
    /// Six bytes, padded to eight.
    pub const MAC: usize = header::BYTES + 16;
    pub const MAC_BYTES: usize = 6;
    /// IPv4 address in network byte order.
    pub const IP: usize = header::BYTES + 24;
    /// NUL-padded interface name.
    pub const BRIDGE: usize = header::BYTES + 28;
    pub const BRIDGE_BYTES: usize = 16;
    pub const VIF_ID: usize = header::BYTES + 44;
    pub const REQUEST_RX_COPY: usize = header::BYTES + 48;
    pub const CTRL_RING_REF: usize = header::BYTES + 52;
    pub const CTRL_EVENT_CHANNEL: usize = header::BYTES + 56;

    /// Queue record: tx ring ref, rx ring ref, tx event channel, rx event channel.
    ///
    /// An rx event channel of 0 means the queue uses a single shared channel.
    pub mod queue {
        pub const TX_RING_REF: usize = 0;
        pub const RX_RING_REF: usize = 4;
        pub const TX_EVENT_CHANNEL: usize = 8;
        pub const RX_EVENT_CHANNEL: usize = 12;
        pub const BYTES: usize = 16;
    }

    pub const INLINE_QUEUE: usize = 128;
    pub const QUEUES: usize = INLINE_QUEUE + queue::BYTES;

    pub const END: usize = QUEUES + super::MAX_QUEUES * queue::BYTES;

    const _: () = assert!(CTRL_EVENT_CHANNEL + 4 <= INLINE_QUEUE);
    const _: () = assert!(END <= super::PAGE_SIZE);
}

/// System-control payload.
pub mod sysctl {
    use super::header;

    /// [`crate::SysctlCommand`] bits written by the backend.
    pub const COMMAND: usize = header::BYTES;

    pub const END: usize = COMMAND + 4;
}
