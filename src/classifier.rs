use async_trait::async_trait;

use crate::types::{FailureKind, ImagePayload, StyleClassification};

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Credentials were rejected; no further call can succeed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl ClassifyError {
    /// Per-item failure kind, or `None` when the error is fatal to the run.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::RateLimited(_) => Some(FailureKind::RateLimited),
            Self::InvalidInput(_) => Some(FailureKind::InvalidInput),
            Self::Network(_) => Some(FailureKind::Network),
            Self::MalformedResponse(_) => Some(FailureKind::MalformedResponse),
            Self::Unauthorized(_) => None,
        }
    }
}

/// Remote image classifier. Calling again after any error must be safe.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &ImagePayload) -> Result<StyleClassification, ClassifyError>;
}
