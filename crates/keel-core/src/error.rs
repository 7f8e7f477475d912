//! Error types for Keel.

use thiserror::Error;

use crate::build::BuildStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("secret {name} unavailable: {reason}")]
    SecretUnavailable { name: String, reason: String },

    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: BuildStatus, to: BuildStatus },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted(_) | Error::Unavailable(_) | Error::DispatchFailure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
