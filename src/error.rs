use std::fmt::Display;

use thiserror::Error;

use crate::{
    access_key::MalformedKey,
    services::{ConstructionError, SigningError},
    sequence::AllocationError,
    sri::{AuthorityError, AuthorityRejection},
    store::StoreError,
};

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure taxonomy of one authorization run. The pipeline branches on the
/// variant, never on the message text.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed access key: {0}")]
    MalformedKey(#[from] MalformedKey),
    #[error("document construction failed: {0}")]
    Construction(#[from] ConstructionError),
    #[error("document signing failed: {0}")]
    Signing(#[from] SigningError),
    #[error("authority service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Rejected(AuthorityRejection),
    #[error("{0}")]
    Unexpected(String),
}

impl PipelineError {
    pub fn unexpected<E: Display>(error: E) -> Self {
        Self::Unexpected(error.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::ServiceUnavailable(_))
    }
}

impl From<AuthorityError> for PipelineError {
    fn from(value: AuthorityError) -> Self {
        match value {
            AuthorityError::ServiceUnavailable(message) => PipelineError::ServiceUnavailable(message),
            AuthorityError::Rejected(rejection) => PipelineError::Rejected(rejection),
            other => PipelineError::Unexpected(other.to_string()),
        }
    }
}

impl From<AllocationError> for PipelineError {
    fn from(value: AllocationError) -> Self {
        PipelineError::unexpected(value)
    }
}

impl From<StoreError> for PipelineError {
    fn from(value: StoreError) -> Self {
        PipelineError::unexpected(value)
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(value: anyhow::Error) -> Self {
        PipelineError::Unexpected(format!("{value:#}"))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(value: std::io::Error) -> Self {
        PipelineError::unexpected(value)
    }
}
