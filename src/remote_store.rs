//! Remote Store Module
//!
//! The object store collaborator the proxy forwards cache misses and uploads to. The
//! production implementation is [`crate::s3_client::HttpObjectStore`]; tests substitute an
//! in-memory double.

use crate::error::StoreResult;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;

/// A staged upload handed to the remote store
#[derive(Debug)]
pub struct UploadBody {
    pub file: File,
    pub size_bytes: u64,
}

impl UploadBody {
    pub fn new(file: File, size_bytes: u64) -> Self {
        Self { file, size_bytes }
    }

    /// Read the whole staged file into memory
    pub async fn into_bytes(mut self) -> std::io::Result<Bytes> {
        use tokio::io::AsyncReadExt;

        let mut buffer = Vec::with_capacity(self.size_bytes as usize);
        self.file.read_to_end(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}

/// Operations the proxy needs from an object store.
///
/// Every failure is reported as a [`crate::error::RemoteStoreError`]; a not-found answer is
/// an error with status 404 which callers treat as a negative lookup.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the full object payload
    async fn fetch(&self, bucket: &str, key: &str) -> StoreResult<Bytes>;

    /// Store a staged file as the object payload
    async fn store(&self, bucket: &str, key: &str, body: UploadBody) -> StoreResult<()>;

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<()>;

    /// Succeeds if the object exists
    async fn head_exists(&self, bucket: &str, key: &str) -> StoreResult<()>;
}
