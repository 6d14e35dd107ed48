use std::env;
use std::time::Duration;

use noxs_abi::layout::{DEV_COUNT_MAX, MAX_QUEUES, MAX_RING_PAGE_ORDER};
use noxs_abi::DomId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Parse { var: &'static str, value: String },

    #[error("max_queues must be within 1..=16, got {0}")]
    MaxQueues(u32),

    #[error("max_ring_page_order must be at most 4, got {0}")]
    RingPageOrder(u32),

    #[error("list_capacity must be within 1..=32, got {0}")]
    ListCapacity(usize),
}

/// Backend-wide tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Domain the registry runs in; keys naming another backend never match.
    pub backend_id: DomId,
    /// Largest queue count offered to block and network frontends.
    pub max_queues: u32,
    /// Largest block ring page order offered to frontends.
    pub max_ring_page_order: u32,
    /// Default `list` capacity.
    pub list_capacity: usize,
    /// How long `guest_close` waits for the frontend to reach `Closed`.
    pub guest_close_timeout: Duration,
    /// How long `shutdown` waits for connected frontends to close.
    pub shutdown_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            backend_id: 0,
            max_queues: cpus.clamp(1, MAX_QUEUES) as u32,
            max_ring_page_order: MAX_RING_PAGE_ORDER,
            list_capacity: DEV_COUNT_MAX,
            guest_close_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl BackendConfig {
    /// Reads overrides from the process environment.
    ///
    /// - `NOXS_BACKEND_ID`
    /// - `NOXS_MAX_QUEUES`
    /// - `NOXS_MAX_RING_PAGE_ORDER`
    /// - `NOXS_GUEST_CLOSE_TIMEOUT_MS`
    /// - `NOXS_SHUTDOWN_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Like [`BackendConfig::from_env`] with an injectable variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = parse(&lookup, "NOXS_BACKEND_ID")? {
            cfg.backend_id = v;
        }
        if let Some(v) = parse(&lookup, "NOXS_MAX_QUEUES")? {
            cfg.max_queues = v;
        }
        if let Some(v) = parse(&lookup, "NOXS_MAX_RING_PAGE_ORDER")? {
            cfg.max_ring_page_order = v;
        }
        if let Some(ms) = parse(&lookup, "NOXS_GUEST_CLOSE_TIMEOUT_MS")? {
            cfg.guest_close_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "NOXS_SHUTDOWN_TIMEOUT_MS")? {
            cfg.shutdown_timeout = Duration::from_millis(ms);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queues == 0 || self.max_queues as usize > MAX_QUEUES {
            return Err(ConfigError::MaxQueues(self.max_queues));
        }
        if self.max_ring_page_order > MAX_RING_PAGE_ORDER {
            return Err(ConfigError::RingPageOrder(self.max_ring_page_order));
        }
        if self.list_capacity == 0 || self.list_capacity > DEV_COUNT_MAX {
            return Err(ConfigError::ListCapacity(self.list_capacity));
        }
        Ok(())
    }

    pub fn with_max_queues(mut self, max_queues: u32) -> Self {
        self.max_queues = max_queues;
        self
    }

    pub fn with_timeouts(mut self, guest_close: Duration, shutdown: Duration) -> Self {
        self.guest_close_timeout = guest_close;
        self.shutdown_timeout = shutdown;
        self
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Parse { var, value })
}
