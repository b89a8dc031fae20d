use thiserror::Error;

/// Failure reported by a pluggable collaborator (tokenizer, embedder).
///
/// `Unavailable` is a degradation signal: callers are expected to fall back
/// to a weaker strategy instead of failing the whole operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("{backend} is unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("{backend} failed: {reason}")]
    Failed { backend: String, reason: String },
}

impl BackendError {
    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn failed(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Failed {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector for {0} contains non-finite values")]
    NonFinite(String),

    #[error("vector index dimension must be greater than zero")]
    ZeroDimension,
}
