use recall_indexing::{BackendError, IndexError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An optional component is missing. Callers usually degrade instead of
    /// surfacing this.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("external failure: {0}")]
    ExternalFailure(String),

    #[error("corrupt state: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

impl MemoryError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        MemoryError::NotFound(format!("{} {}", what, id))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MemoryError::NotFound(_))
    }

    /// Short machine-readable kind, used by the service layer.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::NotFound(_) => "not_found",
            MemoryError::InvalidArgument(_) => "invalid_argument",
            MemoryError::Unavailable(_) => "unavailable",
            MemoryError::Conflict(_) => "conflict",
            MemoryError::ExternalFailure(_) => "external_failure",
            MemoryError::Corrupt(_) => "corrupt",
            MemoryError::Storage(_) => "storage",
            MemoryError::Serialization(_) => "serialization",
            MemoryError::Csv(_) => "csv",
            MemoryError::Io(_) => "io",
            MemoryError::Pattern(_) => "pattern",
        }
    }
}

impl From<BackendError> for MemoryError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable { .. } => MemoryError::Unavailable(err.to_string()),
            BackendError::Failed { .. } => MemoryError::ExternalFailure(err.to_string()),
        }
    }
}

impl From<IndexError> for MemoryError {
    fn from(err: IndexError) -> Self {
        MemoryError::InvalidArgument(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MemoryError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        MemoryError::ExternalFailure(format!("timed out: {}", err))
    }
}
