//! Attachment bytes on local disk.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::util::sanitize_file_name;
use crate::{Error, Result};

/// Persists and retrieves attachment bytes by path.
#[async_trait]
pub trait ResourceFileStore: Send + Sync {
    /// Write `bytes` under a fresh unique name derived from `file_name`.
    async fn store(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf>;

    /// Read a stored blob. A missing file yields `Ok(None)`.
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Remove a stored blob. Removing a missing file succeeds.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Delete every stored blob not listed in `keep`, returning how many went.
    async fn remove_orphans(&self, keep: &HashSet<PathBuf>) -> Result<usize>;
}

/// `tokio::fs`-backed store rooted at one directory per account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsResourceStore {
    root: PathBuf,
}

impl FsResourceStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_inside_root(&self, path: &Path) -> bool {
        path.parent() == Some(self.root.as_path())
    }
}

#[async_trait]
impl ResourceFileStore for FsResourceStore {
    async fn store(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;

        let name = format!("{}-{}", Uuid::now_v7(), sanitize_file_name(file_name));
        let path = self.root.join(name);
        tokio::fs::write(&path, bytes).await.map_err(|error| {
            Error::Storage(format!("writing {} failed: {error}", path.display()))
        })?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "Stored resource blob");
        Ok(path)
    }

    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        if !self.is_inside_root(path) {
            return Err(Error::InvalidInput(format!(
                "refusing to delete {} outside {}",
                path.display(),
                self.root.display()
            )));
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn remove_orphans(&self, keep: &HashSet<PathBuf>) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if keep.contains(&path) {
                continue;
            }
            tokio::fs::remove_file(&path).await?;
            tracing::info!(path = %path.display(), "Removed orphaned resource blob");
            removed += 1;
        }

        Ok(removed)
    }
}
