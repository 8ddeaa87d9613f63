//! Upload Staging Module
//!
//! Holds PUT bodies on local disk between "the build tool finished sending them" and
//! "the remote store acknowledged them". Staging files mirror cache keys as sub-paths of
//! the staging root; an existing file means an upload for that key is already in flight.
//!
//! Also provides the process-wide pending upload budget, which bounds the number of bytes
//! being transferred to the remote store at any one time.

use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use std::fmt::Display;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Directory-backed staging area for uploads in flight
#[derive(Debug, Clone)]
pub struct UploadStaging {
    root: PathBuf,
}

impl UploadStaging {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging path for `key`, or `None` if the key cannot be mapped below the root
    /// (empty, absolute, or containing `.`/`..` components).
    pub fn staging_path(&self, key: &str) -> Option<PathBuf> {
        if key.is_empty() {
            return None;
        }
        let relative = Path::new(key);
        if relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            Some(self.root.join(relative))
        } else {
            None
        }
    }

    /// Atomically create a new staging file.
    ///
    /// Returns `Ok(None)` when a staging file for the path already exists, which means
    /// another upload of the same key is in flight.
    pub async fn create_staging_file(&self, path: &Path) -> Result<Option<File>> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ProxyError::IoError(format!(
                    "Failed to create staging directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(ProxyError::IoError(format!(
                "Failed to create staging file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Stream a request body into a staging file
    pub async fn write_body<B>(mut file: File, body: B) -> Result<()>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let mut body = std::pin::pin!(body);
        while let Some(frame) = body.frame().await {
            let frame = frame
                .map_err(|e| ProxyError::HttpError(format!("Failed to read request body: {}", e)))?;
            if let Ok(data) = frame.into_data() {
                file.write_all(&data).await?;
            }
        }
        file.flush().await?;
        Ok(())
    }

    /// Size of a staged file on disk
    pub async fn staged_size(&self, path: &Path) -> Result<u64> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            ProxyError::IoError(format!("Failed to stat {}: {}", path.display(), e))
        })?;
        Ok(metadata.len())
    }

    /// Delete a staging file. Failures are logged and swallowed: by the time a file is
    /// removed, the outcome of its upload has already been decided.
    pub async fn remove(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed staging file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Staging file {} already removed", path.display())
            }
            Err(e) => error!("Failed to remove staging file {}: {}", path.display(), e),
        }
    }

    /// Remove the whole staging directory. Used at startup to discard uploads orphaned by
    /// a previous instance, and at shutdown.
    pub fn clear(&self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => info!("Cleared upload staging directory {}", self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to clear upload staging directory {}: {}",
                self.root.display(),
                e
            ),
        }
    }
}

/// Process-wide ceiling on bytes staged but not yet acknowledged by the remote store
#[derive(Debug)]
pub struct PendingUploadBudget {
    ceiling_bytes: u64,
    pending_bytes: AtomicU64,
}

impl PendingUploadBudget {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self {
            ceiling_bytes,
            pending_bytes: AtomicU64::new(0),
        }
    }

    /// Reserve `size` bytes, or `None` if that would exceed the ceiling.
    ///
    /// The reservation is released when the returned charge is dropped.
    pub fn try_charge(self: &Arc<Self>, size: u64) -> Option<BudgetCharge> {
        let ceiling = self.ceiling_bytes;
        self.pending_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                pending
                    .checked_add(size)
                    .filter(|total| *total <= ceiling)
            })
            .ok()
            .map(|_| BudgetCharge {
                budget: Arc::clone(self),
                size,
            })
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes.load(Ordering::Acquire)
    }
}

/// Bytes reserved against the pending upload budget for one upload
#[derive(Debug)]
pub struct BudgetCharge {
    budget: Arc<PendingUploadBudget>,
    size: u64,
}

impl BudgetCharge {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for BudgetCharge {
    fn drop(&mut self) {
        self.budget
            .pending_bytes
            .fetch_sub(self.size, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use tempfile::TempDir;

    #[test]
    fn test_staging_path_mirrors_key() {
        let staging = UploadStaging::new(PathBuf::from("/tmp/uploads"));
        assert_eq!(
            staging.staging_path("ac/abc123").unwrap(),
            PathBuf::from("/tmp/uploads/ac/abc123")
        );
    }

    #[test]
    fn test_staging_path_rejects_escaping_keys() {
        let staging = UploadStaging::new(PathBuf::from("/tmp/uploads"));
        assert!(staging.staging_path("").is_none());
        assert!(staging.staging_path("../etc/passwd").is_none());
        assert!(staging.staging_path("cas/../../x").is_none());
        assert!(staging.staging_path("/absolute").is_none());
        assert!(staging.staging_path("./cas/x").is_none());
    }

    #[tokio::test]
    async fn test_create_staging_file_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let staging = UploadStaging::new(temp_dir.path().join("uploads"));
        let path = staging.staging_path("cas/abc").unwrap();

        let first = staging.create_staging_file(&path).await.unwrap();
        assert!(first.is_some());
        assert!(path.exists());

        let second = staging.create_staging_file(&path).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_write_body_and_size() {
        let temp_dir = TempDir::new().unwrap();
        let staging = UploadStaging::new(temp_dir.path().to_path_buf());
        let path = staging.staging_path("ac/key").unwrap();

        let file = staging.create_staging_file(&path).await.unwrap().unwrap();
        UploadStaging::write_body(file, Full::new(Bytes::from_static(b"hello world")))
            .await
            .unwrap();

        assert_eq!(staging.staged_size(&path).await.unwrap(), 11);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");

        staging.remove(&path).await;
        assert!(!path.exists());
        // Removing twice is harmless
        staging.remove(&path).await;
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let temp_dir = TempDir::new().unwrap();
        let staging = UploadStaging::new(temp_dir.path().join("uploads"));
        let path = staging.staging_path("a/b/c").unwrap();
        staging.create_staging_file(&path).await.unwrap();

        staging.clear();
        assert!(!staging.root().exists());
        // Clearing a missing directory is a no-op
        staging.clear();
    }

    #[test]
    fn test_budget_charge_and_release() {
        let budget = Arc::new(PendingUploadBudget::new(100));

        let first = budget.try_charge(60).unwrap();
        assert_eq!(budget.pending_bytes(), 60);
        assert!(budget.try_charge(41).is_none());
        assert_eq!(budget.pending_bytes(), 60);

        let second = budget.try_charge(40).unwrap();
        assert_eq!(budget.pending_bytes(), 100);
        assert_eq!(second.size(), 40);

        drop(first);
        assert_eq!(budget.pending_bytes(), 40);
        drop(second);
        assert_eq!(budget.pending_bytes(), 0);
    }

    #[test]
    fn test_budget_zero_ceiling_rejects_everything_but_empty() {
        let budget = Arc::new(PendingUploadBudget::new(0));
        assert!(budget.try_charge(1).is_none());
        assert!(budget.try_charge(0).is_some());
    }
}
