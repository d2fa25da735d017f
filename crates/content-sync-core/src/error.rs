use std::time::Duration;

use thiserror::Error;

use crate::version::VersionId;

/// Errors that can occur in the synchronization pipeline.
///
/// Payloads are plain strings so that one outcome can be handed to every
/// caller that joined the same indexing run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Invalid version: {0}")]
    InvalidVersion(VersionId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Indexing failed for version {version}: {reason}")]
    IndexingFailure { version: VersionId, reason: String },

    #[error("Timed out after {waited:?} waiting for version {version} to be cached")]
    Timeout { version: VersionId, waited: Duration },

    #[error("Sync job cancelled: {0}")]
    Cancelled(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unexpected execution error: {0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Coarse classification callers use to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Invalid,
    Transient,
    Fatal,
}

impl SyncError {
    pub fn indexing(version: &VersionId, reason: impl Into<String>) -> Self {
        Self::IndexingFailure {
            version: version.clone(),
            reason: reason.into(),
        }
    }

    /// The version this error is about, when it names one.
    pub fn version(&self) -> Option<&VersionId> {
        match self {
            SyncError::InvalidVersion(version)
            | SyncError::IndexingFailure { version, .. }
            | SyncError::Timeout { version, .. } => Some(version),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::NotFound(_) => ErrorClass::NotFound,
            SyncError::InvalidVersion(_) | SyncError::Forbidden(_) => ErrorClass::Invalid,
            SyncError::Timeout { .. }
            | SyncError::Cancelled(_)
            | SyncError::Io(_)
            | SyncError::IndexingFailure { .. } => ErrorClass::Transient,
            SyncError::Execution(_) => ErrorClass::Fatal,
        }
    }

    /// Returns `true` if triggering the same work again might succeed.
    ///
    /// Nothing in the pipeline retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
