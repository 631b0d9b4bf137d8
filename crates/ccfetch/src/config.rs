//! Run configuration
//!
//! [`FetcherConfig`] mirrors the JSON file. [`FetcherConfig::validate`] checks
//! every combination up front and produces a [`RunConfig`], which is immutable
//! for the rest of the run and builds the fetch backend and sink it names.

use ccfetch_common::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::backoff::{
    BackoffPolicy, BackoffSchedule, DEFAULT_MAX_ATTEMPTS, DEFAULT_THROTTLE_SECONDS,
};
use crate::emitter::fs::DEFAULT_FS_DOCS_PATH;
use crate::emitter::s3::{S3SinkSettings, DEFAULT_SINK_REGION};
use crate::emitter::{Emitter, FileSystemEmitter, OnExists, S3Emitter};
use crate::fetcher::http::{CC_HTTPS_BASE, DEFAULT_TIMEOUT_SECS};
use crate::fetcher::s3::{CC_REGION, CC_S3_BUCKET};
use crate::fetcher::{HttpRangeFetcher, RangeFetcher, S3RangeFetcher};
use crate::index::CdxIndexReader;
use crate::quota::{Ceiling, QuotaLimits};
use crate::rewriter::DigestPathRewriter;
use crate::selector::{AcceptAll, FieldSelector, RecordSelector, SelectorConfig, SelectorError};
use crate::truncated::DEFAULT_TRUNCATED_URLS_FILE;

/// Workers when `numThreads` is not set
pub const DEFAULT_NUM_THREADS: usize = 2;

/// Queue slots per worker when `queueCapacity` is not set
const QUEUE_SLOTS_PER_WORKER: usize = 16;

pub const ENV_NUM_THREADS: &str = "CCFETCH_NUM_THREADS";
pub const ENV_DRY_RUN: &str = "CCFETCH_DRY_RUN";
pub const ENV_MAX_FILES_EXTRACTED: &str = "CCFETCH_MAX_FILES_EXTRACTED";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("numThreads must be at least 1")]
    NoWorkers,

    #[error("{name} must be -1 (unbounded) or a non-negative count, got {value}")]
    InvalidCeiling { name: &'static str, value: i64 },

    #[error("fetcher.maxAttempts must be at least 1")]
    NoAttempts,

    #[error("fetcher.throttleSeconds is empty but maxAttempts is {0}")]
    EmptySchedule(u32),

    #[error("fetcher.timeoutSeconds must be at least 1")]
    ZeroTimeout,

    #[error("docs.bucket is required when docs.profile is set")]
    MissingBucket,

    #[error("indices.paths lists no index files")]
    NoIndices,

    #[error("invalid targetPathPattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("invalid recordSelector: {0}")]
    Selector(#[from] SelectorError),

    #[error("invalid value '{value}' for {var}")]
    Env { var: &'static str, value: String },
}

impl From<ConfigError> for HarvestError {
    fn from(err: ConfigError) -> Self {
        HarvestError::config(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicesConfig {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

/// The `fetcher` block. A `profile` selects the S3 backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchSourceConfig {
    pub profile: Option<String>,
    pub throttle_seconds: Option<Vec<u64>>,
    pub max_attempts: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub base_url: Option<String>,
}

/// The `docs` block. A `profile` selects the S3 sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocsConfig {
    pub profile: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub endpoint: Option<String>,
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub on_exists: OnExists,
}

/// Configuration file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetcherConfig {
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    #[serde(default = "unbounded")]
    pub max_records: i64,

    #[serde(default = "unbounded")]
    pub max_files_extracted: i64,

    #[serde(default = "unbounded")]
    pub max_files_truncated: i64,

    #[serde(default = "default_truncated_urls_file")]
    pub truncated_urls_file: PathBuf,

    #[serde(default)]
    pub target_path_pattern: String,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub queue_capacity: Option<usize>,

    #[serde(default)]
    pub record_selector: Option<SelectorConfig>,

    #[serde(default)]
    pub indices: IndicesConfig,

    #[serde(default)]
    pub fetcher: FetchSourceConfig,

    #[serde(default, alias = "emitter")]
    pub docs: DocsConfig,
}

fn default_num_threads() -> usize {
    DEFAULT_NUM_THREADS
}

fn unbounded() -> i64 {
    -1
}

fn default_truncated_urls_file() -> PathBuf {
    PathBuf::from(DEFAULT_TRUNCATED_URLS_FILE)
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            num_threads: DEFAULT_NUM_THREADS,
            max_records: -1,
            max_files_extracted: -1,
            max_files_truncated: -1,
            truncated_urls_file: default_truncated_urls_file(),
            target_path_pattern: String::new(),
            dry_run: false,
            queue_capacity: None,
            record_selector: None,
            indices: IndicesConfig::default(),
            fetcher: FetchSourceConfig::default(),
            docs: DocsConfig::default(),
        }
    }
}

impl FetcherConfig {
    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> std::result::Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply `CCFETCH_*` overrides from the environment.
    pub fn apply_env(&mut self) -> std::result::Result<(), ConfigError> {
        if let Ok(value) = std::env::var(ENV_NUM_THREADS) {
            self.num_threads = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_NUM_THREADS,
                value: value.clone(),
            })?;
        }

        if let Ok(value) = std::env::var(ENV_DRY_RUN) {
            self.dry_run = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: ENV_DRY_RUN,
                        value,
                    })
                }
            };
        }

        if let Ok(value) = std::env::var(ENV_MAX_FILES_EXTRACTED) {
            self.max_files_extracted = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_MAX_FILES_EXTRACTED,
                value: value.clone(),
            })?;
        }

        Ok(())
    }

    /// Check every setting and resolve defaults.
    pub fn validate(&self) -> std::result::Result<RunConfig, ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::NoWorkers);
        }

        let limits = QuotaLimits {
            max_records: ceiling("maxRecords", self.max_records)?,
            max_files_extracted: ceiling("maxFilesExtracted", self.max_files_extracted)?,
            max_files_truncated: ceiling("maxFilesTruncated", self.max_files_truncated)?,
        };

        let backoff = self.backoff_policy()?;
        let backend = self.fetch_backend()?;
        let sink = self.sink()?;

        let selector = self
            .record_selector
            .as_ref()
            .map(FieldSelector::compile)
            .transpose()?;

        if self.indices.paths.is_empty() {
            return Err(ConfigError::NoIndices);
        }

        DigestPathRewriter::check_pattern(&self.target_path_pattern).map_err(|reason| {
            ConfigError::InvalidPattern {
                pattern: self.target_path_pattern.clone(),
                reason,
            }
        })?;

        Ok(RunConfig {
            num_threads: self.num_threads,
            queue_capacity: self
                .queue_capacity
                .filter(|&c| c > 0)
                .unwrap_or(self.num_threads.saturating_mul(QUEUE_SLOTS_PER_WORKER)),
            limits,
            backoff,
            backend,
            sink,
            truncated_urls_file: self.truncated_urls_file.clone(),
            target_path_pattern: self.target_path_pattern.clone(),
            dry_run: self.dry_run,
            selector,
            index_paths: self.indices.paths.clone(),
        })
    }

    fn backoff_policy(&self) -> std::result::Result<BackoffPolicy, ConfigError> {
        let max_attempts = self.fetcher.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }

        let schedule = match &self.fetcher.throttle_seconds {
            Some(secs) => BackoffSchedule::from_secs(secs),
            None => BackoffSchedule::from_secs(&DEFAULT_THROTTLE_SECONDS),
        };
        if schedule.is_empty() && max_attempts > 1 {
            return Err(ConfigError::EmptySchedule(max_attempts));
        }

        Ok(BackoffPolicy::new(schedule, max_attempts))
    }

    fn fetch_backend(&self) -> std::result::Result<FetchBackend, ConfigError> {
        if let Some(profile) = &self.fetcher.profile {
            return Ok(FetchBackend::ObjectStorage {
                profile: profile.clone(),
                bucket: CC_S3_BUCKET.to_string(),
                region: CC_REGION.to_string(),
            });
        }

        let timeout_secs = self.fetcher.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(FetchBackend::Direct {
            base_url: self
                .fetcher
                .base_url
                .clone()
                .unwrap_or_else(|| CC_HTTPS_BASE.to_string()),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    fn sink(&self) -> std::result::Result<SinkConfig, ConfigError> {
        let docs = &self.docs;
        match &docs.profile {
            Some(profile) => {
                let bucket = docs
                    .bucket
                    .clone()
                    .filter(|b| !b.trim().is_empty())
                    .ok_or(ConfigError::MissingBucket)?;
                Ok(SinkConfig::ObjectStorage {
                    settings: S3SinkSettings {
                        profile: profile.clone(),
                        bucket,
                        region: docs
                            .region
                            .clone()
                            .unwrap_or_else(|| DEFAULT_SINK_REGION.to_string()),
                        prefix: docs.prefix.clone(),
                        endpoint: docs.endpoint.clone(),
                    },
                    on_exists: docs.on_exists,
                })
            }
            None => Ok(SinkConfig::Filesystem {
                base: docs
                    .path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FS_DOCS_PATH)),
                on_exists: docs.on_exists,
            }),
        }
    }
}

fn ceiling(name: &'static str, value: i64) -> std::result::Result<Ceiling, ConfigError> {
    Ceiling::from_limit(value).ok_or(ConfigError::InvalidCeiling { name, value })
}

/// Where fetched ranges come from, fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchBackend {
    Direct {
        base_url: String,
        timeout: Duration,
    },
    ObjectStorage {
        profile: String,
        bucket: String,
        region: String,
    },
}

impl FetchBackend {
    pub async fn build(&self) -> Result<Arc<dyn RangeFetcher>> {
        Ok(match self {
            FetchBackend::Direct { base_url, timeout } => {
                Arc::new(HttpRangeFetcher::new(base_url.clone(), *timeout)?)
            }
            FetchBackend::ObjectStorage {
                profile,
                bucket,
                region,
            } => Arc::new(S3RangeFetcher::new(profile, bucket.clone(), region.clone()).await),
        })
    }

    pub fn describe(&self) -> String {
        match self {
            FetchBackend::Direct { base_url, .. } => base_url.clone(),
            FetchBackend::ObjectStorage {
                profile, bucket, ..
            } => format!("s3://{} (profile {})", bucket, profile),
        }
    }
}

/// Where extracted documents go, fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    Filesystem {
        base: PathBuf,
        on_exists: OnExists,
    },
    ObjectStorage {
        settings: S3SinkSettings,
        on_exists: OnExists,
    },
}

impl SinkConfig {
    pub async fn build(&self) -> Arc<dyn Emitter> {
        match self {
            SinkConfig::Filesystem { base, on_exists } => {
                Arc::new(FileSystemEmitter::new(base.clone(), *on_exists))
            }
            SinkConfig::ObjectStorage {
                settings,
                on_exists,
            } => Arc::new(S3Emitter::new(settings.clone(), *on_exists).await),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SinkConfig::Filesystem { base, .. } => format!("file://{}", base.display()),
            SinkConfig::ObjectStorage { settings, .. } => match &settings.prefix {
                Some(prefix) => format!("s3://{}/{}", settings.bucket, prefix.trim_matches('/')),
                None => format!("s3://{}", settings.bucket),
            },
        }
    }
}

/// Validated, immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub num_threads: usize,
    pub queue_capacity: usize,
    pub limits: QuotaLimits,
    pub backoff: BackoffPolicy,
    pub backend: FetchBackend,
    pub sink: SinkConfig,
    pub truncated_urls_file: PathBuf,
    pub target_path_pattern: String,
    pub dry_run: bool,
    pub selector: Option<FieldSelector>,
    pub index_paths: Vec<PathBuf>,
}

impl RunConfig {
    pub fn selector(&self) -> Arc<dyn RecordSelector> {
        match &self.selector {
            Some(selector) => Arc::new(selector.clone()),
            None => Arc::new(AcceptAll),
        }
    }

    pub fn rewriter(&self) -> Arc<DigestPathRewriter> {
        Arc::new(DigestPathRewriter::new(self.target_path_pattern.clone()))
    }

    pub fn index_source(&self) -> CdxIndexReader {
        CdxIndexReader::new(self.index_paths.clone())
    }

    pub fn log_summary(&self) {
        info!(
            workers = self.num_threads,
            queue = self.queue_capacity,
            source = %self.backend.describe(),
            sink = %self.sink.describe(),
            max_records = %self.limits.max_records,
            max_files_extracted = %self.limits.max_files_extracted,
            max_files_truncated = %self.limits.max_files_truncated,
            max_attempts = self.backoff.max_attempts(),
            dry_run = self.dry_run,
            index_files = self.index_paths.len(),
            "Run configuration"
        );
    }
}
