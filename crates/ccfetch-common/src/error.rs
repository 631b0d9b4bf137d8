//! Error types for ccfetch

use thiserror::Error;

/// Result type alias for run-level operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Run-level error.
///
/// Per-record failures never surface as a `HarvestError`; they are contained
/// by the pipeline. Anything of this type either stops the run from starting
/// or aborts it.
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl HarvestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Whether the error was raised before any record could be processed.
    pub fn is_startup(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Serialization(_))
    }
}
