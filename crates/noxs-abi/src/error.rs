use thiserror::Error;

pub type Result<T> = std::result::Result<T, LayoutError>;

/// Errors raised while decoding a control page or an ABI value.
///
/// The page is shared with a less trusted domain, so every decode path reports malformed
/// content instead of assuming it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("bad control page magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("unsupported control page version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("unknown device type {0}")]
    UnknownDeviceType(u32),

    #[error("control page holds a {found} device, expected {expected}")]
    DeviceTypeMismatch { expected: &'static str, found: &'static str },

    #[error("invalid connection state {0}")]
    InvalidState(u32),

    #[error("invalid watch state {0}")]
    InvalidWatchState(u32),

    #[error("field at offset {offset:#x} holds at most {max} bytes, got {len}")]
    FieldTooLong { offset: usize, max: usize, len: usize },

    #[error("access at offset {offset:#x} (len {len}) is outside the control page")]
    OutOfBounds { offset: usize, len: usize },

    #[error("queue index {index} out of range (max {max})")]
    QueueIndex { index: usize, max: usize },

    #[error("invalid bus identifier {0:?}")]
    InvalidBusId(String),
}
