use std::{collections::BTreeMap, future::Future, pin::Pin};

use crate::render::{FullConfig, Operation};

pub mod command;
pub mod haproxy;
pub mod memory;

/// Failure talking to the proxy, classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Proxy unreachable, timed out, or failed server-side; worth retrying.
    Unavailable { details: String },
    /// Proxy refused the change; retrying the same input cannot succeed.
    Rejected { details: String },
}

impl ControlError {
    pub fn unavailable(details: impl Into<String>) -> Self {
        Self::Unavailable {
            details: details.into(),
        }
    }

    pub fn rejected(details: impl Into<String>) -> Self {
        Self::Rejected {
            details: details.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "proxy unavailable: {details}"),
            Self::Rejected { details } => write!(f, "proxy rejected change: {details}"),
        }
    }
}

impl std::error::Error for ControlError {}

pub type ControlFuture<T> = Pin<Box<dyn Future<Output = Result<T, ControlError>> + Send>>;

/// Capabilities of the running proxy.
pub trait ControlSurface: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the proxy can take incremental changes at all.
    fn supports_dynamic(&self) -> bool;

    /// Whether this particular operation can be applied without a reload.
    fn accepts(&self, op: &Operation) -> bool;

    fn apply(&self, op: &Operation) -> ControlFuture<()>;

    /// Writes the full configuration to disk without activating it.
    fn write_config(&self, full: &FullConfig) -> ControlFuture<()>;

    /// Validates and gracefully activates the configuration on disk.
    fn reload(&self) -> ControlFuture<()>;

    /// Live route table as `host+path` -> backend name.
    fn live_routes(&self) -> ControlFuture<BTreeMap<String, String>>;

    fn probe(&self) -> ControlFuture<()>;
}
