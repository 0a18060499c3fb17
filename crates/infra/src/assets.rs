//! Where composed cover images end up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use storyforge_core::JobId;

#[derive(Debug, Clone, Error)]
pub enum AssetError {
    #[error("asset io error: {0}")]
    Io(String),
    #[error("asset not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store the cover PNG for `job_id`, returning its uri.
    async fn put_cover(&self, job_id: JobId, png: Vec<u8>) -> Result<String, AssetError>;

    async fn get(&self, uri: &str) -> Result<Vec<u8>, AssetError>;
}

/// In-memory asset store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAssetStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn put_cover(&self, job_id: JobId, png: Vec<u8>) -> Result<String, AssetError> {
        let uri = format!("mem://covers/{job_id}.png");
        self.blobs
            .write()
            .map_err(|_| AssetError::Io("asset lock poisoned".into()))?
            .insert(uri.clone(), png);
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, AssetError> {
        self.blobs
            .read()
            .map_err(|_| AssetError::Io("asset lock poisoned".into()))?
            .get(uri)
            .cloned()
            .ok_or_else(|| AssetError::NotFound(uri.to_string()))
    }
}

/// Writes covers under a root directory as `<job_id>.png`.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    root: PathBuf,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, uri: &str) -> Result<PathBuf, AssetError> {
        let name = uri
            .strip_prefix("file://")
            .and_then(|p| PathBuf::from(p).file_name().map(|n| n.to_owned()))
            .ok_or_else(|| AssetError::NotFound(uri.to_string()))?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn put_cover(&self, job_id: JobId, png: Vec<u8>) -> Result<String, AssetError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| AssetError::Io(e.to_string()))?;
        let path = self.root.join(format!("{job_id}.png"));
        tokio::fs::write(&path, &png)
            .await
            .map_err(|e| AssetError::Io(e.to_string()))?;
        debug!(job_id = %job_id, path = %path.display(), bytes = png.len(), "cover written");
        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, AssetError> {
        let path = self.path_for(uri)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AssetError::NotFound(uri.to_string()),
            _ => AssetError::Io(e.to_string()),
        })
    }
}
