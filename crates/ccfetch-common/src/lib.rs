//! ccfetch Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Error handling and logging shared by the ccfetch workspace members.
//!
//! # Example
//!
//! ```no_run
//! use ccfetch_common::logging::{init_logging, LogConfig};
//! use ccfetch_common::{HarvestError, Result};
//!
//! fn start() -> Result<()> {
//!     let config = LogConfig::from_env()
//!         .map_err(|e| HarvestError::Config(e.to_string()))?;
//!     init_logging(&config).map_err(|e| HarvestError::Config(e.to_string()))?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{HarvestError, Result};
