//! Error types for job service operations.

use thiserror::Error;

use super::status::Status;

/// Errors produced by job service components.
#[derive(Debug, Error)]
pub enum JobServiceError {
    /// Malformed job/policy input, unknown job name, invalid cron or URL.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Unknown job or policy identifier.
    #[error("not found: {0}")]
    NotFound(String),
    /// Duplicate submission of a unique job.
    #[error("conflict: {0}")]
    Conflict(String),
    /// A status update was rejected because the stored status is newer.
    #[error("status mismatch: current status {current} does not accept {target}")]
    StatusMismatch {
        /// Status currently recorded in the store.
        current: Status,
        /// Status the caller tried to apply.
        target: Status,
    },
    /// Shared store failure with context.
    #[error("backend error: {0}")]
    Backend(String),
    /// Payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Contract violation or unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input was rejected; no side effects happened.
    BadRequest,
    /// The referenced job or policy does not exist.
    NotFound,
    /// The request collides with existing state.
    Conflict,
    /// Store, serialization or contract failure.
    Internal,
}

impl JobServiceError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::StatusMismatch { .. }
            | Self::Backend(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true for a rejected out-of-order status update.
    #[must_use]
    pub const fn is_status_mismatch(&self) -> bool {
        matches!(self, Self::StatusMismatch { .. })
    }

    pub(crate) fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, JobServiceError>;

/// Application-facing result using anyhow for job implementations.
pub type AppResult<T> = std::result::Result<T, anyhow::Error>;
