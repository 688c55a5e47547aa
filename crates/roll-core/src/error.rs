use std::time::Duration;

use thiserror::Error;

/// Errors returned by roll-core operations.
///
/// Rejections (no face, several faces, unknown identity) and the normal
/// negative results (`NoMatch`, `AlreadyMarked`) are outcome values, not
/// errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("embedding extraction failed: {0}")]
    Extraction(String),

    #[error("embedding extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),

    #[error("contention on {0}, retry later")]
    Contention(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// True for the failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Storage(_) | CoreError::Contention(_))
    }

    /// True for malformed-input failures (surfaced, never retried).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::DimensionMismatch { .. }
                | CoreError::Validation(_)
                | CoreError::Extraction(_)
                | CoreError::ExtractionTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
