//! Filesystem sink

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{validate_name, EmitError, Emitter, OnExists, StoreOutcome};

/// Base directory used when none is configured
pub const DEFAULT_FS_DOCS_PATH: &str = "docs";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes each object to `<base>/<name>`.
#[derive(Debug, Clone)]
pub struct FileSystemEmitter {
    base: PathBuf,
    on_exists: OnExists,
}

impl FileSystemEmitter {
    pub fn new(base: impl Into<PathBuf>, on_exists: OnExists) -> Self {
        Self {
            base: base.into(),
            on_exists,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn io_err(name: &str, source: std::io::Error) -> EmitError {
        EmitError::Io {
            name: name.to_string(),
            source,
        }
    }

    /// Create the file exclusively; an existing target is left untouched.
    async fn write_new(&self, name: &str, path: &Path, data: &[u8]) -> Result<bool, EmitError> {
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(Self::io_err(name, e)),
        };

        let written = async {
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            // Never leave a partial file behind for a later run to skip.
            if let Err(cleanup) = fs::remove_file(path).await {
                warn!(path = %path.display(), error = %cleanup, "Failed to remove partial file");
            }
            return Err(Self::io_err(name, e));
        }

        Ok(true)
    }

    /// Write beside the target and rename over it.
    async fn write_replace(&self, name: &str, path: &Path, data: &[u8]) -> Result<(), EmitError> {
        let tmp = path.with_extension(format!(
            "ccfetch-tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        fs::write(&tmp, data)
            .await
            .map_err(|e| Self::io_err(name, e))?;

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Self::io_err(name, e));
        }
        Ok(())
    }
}

#[async_trait]
impl Emitter for FileSystemEmitter {
    async fn store(&self, name: &str, data: Vec<u8>) -> Result<StoreOutcome, EmitError> {
        validate_name(name)?;
        let path = self.base.join(name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(name, e))?;
        }

        let bytes = data.len() as u64;
        match self.on_exists {
            OnExists::Replace => {
                self.write_replace(name, &path, &data).await?;
            }
            OnExists::Skip => {
                if !self.write_new(name, &path, &data).await? {
                    debug!(path = %path.display(), "Target exists, skipping");
                    return Ok(StoreOutcome::SkippedExisting);
                }
            }
            OnExists::Error => {
                if !self.write_new(name, &path, &data).await? {
                    return Err(EmitError::AlreadyExists(path.display().to_string()));
                }
            }
        }

        debug!(path = %path.display(), bytes, "Stored file");
        Ok(StoreOutcome::Stored { bytes })
    }

    fn describe(&self) -> String {
        format!("file://{}", self.base.display())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_creates_nested_dirs() {
        let dir = TempDir::new().unwrap();
        let emitter = FileSystemEmitter::new(dir.path(), OnExists::Skip);

        let outcome = emitter.store("AB/CD/ABCDEF", b"payload".to_vec()).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Stored { bytes: 7 });
        assert_eq!(
            std::fs::read(dir.path().join("AB/CD/ABCDEF")).unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn test_skip_leaves_existing_content() {
        let dir = TempDir::new().unwrap();
        let emitter = FileSystemEmitter::new(dir.path(), OnExists::Skip);
        std::fs::write(dir.path().join("doc"), b"original").unwrap();

        let outcome = emitter.store("doc", b"replacement".to_vec()).await.unwrap();
        assert_eq!(outcome, StoreOutcome::SkippedExisting);
        assert_eq!(std::fs::read(dir.path().join("doc")).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_replace_overwrites() {
        let dir = TempDir::new().unwrap();
        let emitter = FileSystemEmitter::new(dir.path(), OnExists::Replace);
        std::fs::write(dir.path().join("doc"), b"original").unwrap();

        emitter.store("doc", b"new".to_vec()).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("doc")).unwrap(), b"new");
        // no temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_error_policy() {
        let dir = TempDir::new().unwrap();
        let emitter = FileSystemEmitter::new(dir.path(), OnExists::Error);
        emitter.store("doc", b"one".to_vec()).await.unwrap();

        let err = emitter.store("doc", b"two".to_vec()).await.unwrap_err();
        assert!(matches!(err, EmitError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let dir = TempDir::new().unwrap();
        let emitter = FileSystemEmitter::new(dir.path(), OnExists::Skip);
        let err = emitter.store("../outside", vec![1]).await.unwrap_err();
        assert!(matches!(err, EmitError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_unwritable_base_is_io_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a dir").unwrap();

        let emitter = FileSystemEmitter::new(&blocker, OnExists::Skip);
        let err = emitter.store("doc", vec![1]).await.unwrap_err();
        assert!(matches!(err, EmitError::Io { .. }));
    }
}
