//! Object storage: the `BlobStore` capability and file relay helpers.
//!
//! Two backends: an S3-compatible HTTP gateway (PUT/GET `{endpoint}/{bucket}/{key}`)
//! and a local directory tree for single-host deployments and tests. Keys are
//! request-scoped and unique, so overwriting on retry is fine.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("storage api error: {0}")]
    Api(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key/value object storage addressed by (bucket, key).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), BlobError>;
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;
}

/// S3-compatible HTTP gateway client.
#[derive(Clone)]
pub struct HttpBlobStore {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, BlobError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, key)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let url = self.object_url(bucket, key);
        let res = self.client.put(&url).body(bytes).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BlobError::Api(format!("PUT {}: {} {}", url, status, body)));
        }
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        let url = self.object_url(bucket, key);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BlobError::Api(format!("GET {}: {} {}", url, status, body)));
        }
        Ok(res.bytes().await?.to_vec())
    }
}

/// Directory-backed store: objects live at `<root>/<bucket>/<key>`.
#[derive(Clone)]
pub struct FsBlobStore {
    root: std::path::PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> std::path::PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        Ok(tokio::fs::read(self.object_path(bucket, key)).await?)
    }
}

/// Upload a local file under (bucket, key). Reported as a result, never a panic;
/// the caller decides the user-visible consequence.
pub async fn upload_file(
    store: &dyn BlobStore,
    local: &Path,
    bucket: &str,
    key: &str,
) -> Result<(), BlobError> {
    let bytes = tokio::fs::read(local).await?;
    store.put(bucket, key, bytes).await?;
    log::debug!("uploaded {} to {}/{}", local.display(), bucket, key);
    Ok(())
}

/// Download (bucket, key) into a local file, creating parent directories.
pub async fn download_to_file(
    store: &dyn BlobStore,
    bucket: &str,
    key: &str,
    local: &Path,
) -> Result<(), BlobError> {
    let bytes = store.get(bucket, key).await?;
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(local, bytes).await?;
    log::debug!("downloaded {}/{} to {}", bucket, key, local.display());
    Ok(())
}
