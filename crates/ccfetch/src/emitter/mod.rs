//! Storage sinks
//!
//! An [`Emitter`] durably stores a named byte stream. The filesystem and S3
//! sinks share one collision policy, [`OnExists`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fs;
pub mod s3;

pub use fs::FileSystemEmitter;
pub use s3::S3Emitter;

/// What to do when the target name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExists {
    /// Leave the existing object alone and report success
    #[default]
    Skip,
    /// Overwrite the existing object
    Replace,
    /// Report [`EmitError::AlreadyExists`]
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored { bytes: u64 },
    SkippedExisting,
}

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("invalid target name '{0}'")]
    InvalidName(String),

    #[error("target already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error writing '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error writing '{name}': {message}")]
    Storage { name: String, message: String },
}

/// Capability: store `data` under `name`.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn store(&self, name: &str, data: Vec<u8>) -> Result<StoreOutcome, EmitError>;

    /// Human-readable destination, e.g. `s3://bucket/prefix`.
    fn describe(&self) -> String;
}

/// Reject names that would escape the sink root.
pub(crate) fn validate_name(name: &str) -> Result<(), EmitError> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.split('/').any(|seg| seg == ".." || seg == "." || seg.is_empty());

    if invalid {
        Err(EmitError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}
