//! Error types for Chengis.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("unknown step kind: {0}")]
    UnknownStepKind(String),

    #[error("missing secret: {0}")]
    MissingSecret(String),

    #[error("secret backend unavailable: {0}")]
    SecretBackendUnavailable(String),

    #[error("policy denied by {policy_id}: {reason}")]
    PolicyDenied { policy_id: String, reason: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
