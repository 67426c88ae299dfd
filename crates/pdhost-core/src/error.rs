//! Error types for the patch engine host
//!
//! The engine boundary only reports success or failure, so most variants
//! name the host operation that observed the failure rather than an engine
//! error code.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{InstanceId, PatchId};

/// Errors that can occur during host operations
#[derive(Debug, Error)]
pub enum HostError {
    /// Instance is unknown, released, or not yet initialized
    #[error("Instance {0} is not available (unknown, released or still initializing)")]
    InvalidInstance(InstanceId),

    /// An instance with this id is already registered
    #[error("Instance {0} already exists")]
    AlreadyExists(InstanceId),

    /// Release of an id the registry does not know
    #[error("Instance {0} not found")]
    NotFound(InstanceId),

    /// The engine rejected the symbolic route
    #[error("Instance {instance}: engine rejected destination '{destination}'")]
    UnknownDestination {
        instance: InstanceId,
        destination: String,
    },

    /// Patch could not be materialized or parsed
    #[error("Patch not found: {path} ({reason})")]
    PatchNotFound { path: PathBuf, reason: String },

    /// Patch handle is not open on this instance
    #[error("Instance {instance}: invalid patch handle {patch}")]
    InvalidHandle { instance: InstanceId, patch: PatchId },

    /// Buffer write without a matching size declaration
    #[error("Instance {instance}: array '{name}' not declared with length {length}")]
    BufferNotDeclared {
        instance: InstanceId,
        name: String,
        length: usize,
    },

    /// The engine returned failure without further detail
    #[error("Engine reported failure: {operation} on instance {instance}")]
    EngineReportedFailure {
        operation: &'static str,
        instance: InstanceId,
    },

    /// Release requested from inside an inbound callback
    #[error("Instance {0} cannot be released from inside a message callback")]
    ReentrantRelease(InstanceId),

    /// A background service thread is gone or dropped its reply
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// IO error during asset materialization
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WAV decoding error while loading a clip
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

impl HostError {
    pub(crate) fn engine(operation: &'static str, instance: InstanceId) -> Self {
        Self::EngineReportedFailure {
            operation,
            instance,
        }
    }
}

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Turn an engine success flag into a result, logging the failure
pub(crate) fn ensure(ok: bool, err: impl FnOnce() -> HostError) -> HostResult<()> {
    if ok {
        return Ok(());
    }
    let err = err();
    log::warn!("{}", err);
    Err(err)
}
