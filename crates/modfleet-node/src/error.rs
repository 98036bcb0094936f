//! Node error types

use crate::bus::BusError;
use modfleet_core::{CodecError, FileType, IdentityError};
use thiserror::Error;

/// Reasons a program or create request is refused.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("validation error: {0}")]
    Validation(#[from] IdentityError),
    #[error("unsupported module kind `{0}`")]
    UnsupportedModuleKind(FileType),
    #[error("capacity exceeded: {max} modules already hosted")]
    CapacityExceeded { max: usize },
}

impl ProvisionError {
    /// Stable label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ProvisionError::Validation(_) => "validation_error",
            ProvisionError::UnsupportedModuleKind(_) => "unsupported_module_kind",
            ProvisionError::CapacityExceeded { .. } => "capacity_exceeded",
        }
    }
}

/// Errors surfaced by node startup and the node handle.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport failure: {0}")]
    TransportFailure(#[from] BusError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("node control loop has stopped")]
    Stopped,
}
