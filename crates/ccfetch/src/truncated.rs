//! Append-only log of URLs that could not be extracted

use ccfetch_common::{HarvestError, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::record::TruncatedRecord;

/// Default location of the truncated log
pub const DEFAULT_TRUNCATED_URLS_FILE: &str = "urls-for-truncated-files.txt";

/// One URL per line. Existing content is kept and new lines are appended.
#[derive(Debug)]
pub struct TruncatedLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TruncatedLog {
    /// Open (or create) the log. Failure here stops the run before any fetch.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                HarvestError::storage(format!(
                    "cannot create directory for truncated log {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                HarvestError::storage(format!(
                    "cannot open truncated log {}: {}",
                    path.display(),
                    e
                ))
            })?;

        info!(path = %path.display(), "Truncated log opened");

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single write under the lock.
    pub async fn append(&self, record: &TruncatedRecord) -> Result<()> {
        let line = format!("{}\n", record);

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(url = %record.url, "Recorded truncated URL");
        Ok(())
    }
}
