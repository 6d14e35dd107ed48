//! Administrative command channel.
//!
//! The privileged entry point the toolstack uses to create, destroy and list devices and to close
//! guests. Requests and replies are plain serde types so any transport can carry them.

use std::sync::Arc;

use noxs_abi::{DeviceConfig, DeviceKey, DomId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::comm::CommHandle;
use crate::driver::GuestCloseReason;
use crate::error::NoxsError;
use crate::registry::{CreateOptions, DeviceList, DeviceRegistry};

/// Identity of the caller issuing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub privileged: bool,
}

impl Credentials {
    pub const fn privileged() -> Self {
        Self { privileged: true }
    }

    pub const fn unprivileged() -> Self {
        Self { privileged: false }
    }
}

fn default_online() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AdminRequest {
    Create {
        key: DeviceKey,
        config: DeviceConfig,
        #[serde(default = "default_online")]
        online: bool,
    },
    Destroy {
        key: DeviceKey,
    },
    List {
        key: DeviceKey,
        #[serde(default)]
        capacity: Option<usize>,
    },
    GuestClose {
        domain: DomId,
        reason: GuestCloseReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdminResponse {
    Created(CommHandle),
    Destroyed { removed: usize },
    Listed(DeviceList),
    GuestClosed { forwarded: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    PermissionDenied,
    InvalidArgument,
    ResourceExhausted,
    ProtocolViolation,
    Busy,
    TimedOut,
    Internal,
}

impl Status {
    /// Negative errno reported to C-style callers.
    pub fn errno(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::PermissionDenied => -1,
            Status::InvalidArgument => -22,
            Status::ResourceExhausted => -12,
            Status::ProtocolViolation => -71,
            Status::Busy => -16,
            Status::TimedOut => -110,
            Status::Internal => -5,
        }
    }
}

impl From<&NoxsError> for Status {
    fn from(err: &NoxsError) -> Self {
        match err {
            NoxsError::PermissionDenied => Status::PermissionDenied,
            NoxsError::InvalidArgument(_) | NoxsError::NoDriver(_) | NoxsError::Unsupported(_) => {
                Status::InvalidArgument
            }
            NoxsError::ResourceExhausted(_) => Status::ResourceExhausted,
            NoxsError::ProtocolViolation(_) | NoxsError::Layout(_) => Status::ProtocolViolation,
            NoxsError::Busy(_) => Status::Busy,
            NoxsError::TimedOut(_) => Status::TimedOut,
            NoxsError::InvalidTransition { .. } | NoxsError::Internal(_) => Status::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminReply {
    pub status: Status,
    pub errno: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<AdminResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AdminReply {
    pub fn ok(payload: AdminResponse) -> Self {
        Self {
            status: Status::Ok,
            errno: 0,
            payload: Some(payload),
            message: None,
        }
    }

    pub fn error(err: &NoxsError) -> Self {
        let status = Status::from(err);
        Self {
            status,
            errno: status.errno(),
            payload: None,
            message: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Dispatches administrative requests to a [`DeviceRegistry`].
#[derive(Debug, Clone)]
pub struct AdminChannel {
    registry: Arc<DeviceRegistry>,
}

impl AdminChannel {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn handle(&self, creds: &Credentials, request: AdminRequest) -> AdminReply {
        match self.dispatch(creds, request) {
            Ok(payload) => AdminReply::ok(payload),
            Err(err) => {
                warn!(error = %err, "admin request failed");
                AdminReply::error(&err)
            }
        }
    }

    fn dispatch(
        &self,
        creds: &Credentials,
        request: AdminRequest,
    ) -> Result<AdminResponse, NoxsError> {
        if !creds.privileged {
            return Err(NoxsError::PermissionDenied);
        }
        debug!(?request, "admin request");
        match request {
            AdminRequest::Create {
                key,
                config,
                online,
            } => self
                .registry
                .create_with(key, &config, CreateOptions { online })
                .map(AdminResponse::Created),
            AdminRequest::Destroy { key } => self
                .registry
                .destroy(&key)
                .map(|removed| AdminResponse::Destroyed { removed }),
            AdminRequest::List { key, capacity } => {
                let capacity = capacity.unwrap_or(self.registry.config().list_capacity);
                self.registry.list(&key, capacity).map(AdminResponse::Listed)
            }
            AdminRequest::GuestClose { domain, reason } => self
                .registry
                .guest_close(domain, reason)
                .map(|forwarded| AdminResponse::GuestClosed { forwarded }),
        }
    }
}
