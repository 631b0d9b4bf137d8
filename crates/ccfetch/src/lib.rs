//! ccfetch
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Harvests documents referenced by Common Crawl index records. Each selected
//! record is fetched as a byte range from the crawl archive, over HTTPS or S3,
//! with escalating backoff on throttling. Its payload is written to a
//! filesystem or S3 sink. Process-wide quotas on records read, files extracted
//! and files truncated are enforced exactly across all workers.
//!
//! # Example
//!
//! ```no_run
//! use ccfetch::config::FetcherConfig;
//! use ccfetch::pipeline::Pipeline;
//! use ccfetch::quota::QuotaTracker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FetcherConfig::load("fetcher.json")?.validate()?;
//!     let quota = Arc::new(QuotaTracker::new(config.limits));
//!     let pipeline = Pipeline::from_config(&config, quota).await?;
//!     let summary = pipeline.run(Box::new(config.index_source())).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod emitter;
pub mod fetcher;
pub mod index;
pub mod pipeline;
pub mod progress;
pub mod quota;
pub mod record;
pub mod rewriter;
pub mod selector;
pub mod truncated;
pub mod warc;

pub use config::{FetcherConfig, RunConfig};
pub use pipeline::{Pipeline, RunSummary};
pub use quota::QuotaTracker;
pub use record::IndexRecord;
