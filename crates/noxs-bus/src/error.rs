use noxs_abi::{DeviceType, LayoutError, XenbusState};
use thiserror::Error;

use crate::hypervisor::HypervisorError;

pub type Result<T> = std::result::Result<T, NoxsError>;

/// Errors surfaced by the transport, the registry and device drivers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NoxsError {
    /// Page, grant, event channel or thread allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The peer published something we cannot accept.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("device busy: {0}")]
    Busy(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no driver registered for {0} devices")]
    NoDriver(DeviceType),

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: XenbusState, to: XenbusState },

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("malformed control page: {0}")]
    Layout(#[from] LayoutError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl NoxsError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        NoxsError::ProtocolViolation(msg.into())
    }

    /// Whether this error means the peer misbehaved; such errors close the device.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, NoxsError::ProtocolViolation(_) | NoxsError::Layout(_))
    }
}

impl From<HypervisorError> for NoxsError {
    fn from(err: HypervisorError) -> Self {
        if err.is_exhaustion() {
            NoxsError::ResourceExhausted(err.to_string())
        } else {
            NoxsError::Internal(err.to_string())
        }
    }
}
