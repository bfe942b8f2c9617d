//! Destination for validated federated key batches. Objects are overwritten by
//! key, so persisting the same page twice leaves a single copy.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum BlobStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("blob store is poisoned")]
    Poisoned,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError>;
}

/// Stores objects as files below a root directory.
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        FilesystemBlobStore { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobStoreError> {
        let relative = Path::new(path);
        // Origins and batch tags come from the gateway, never let them escape the root
        let is_plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if path.is_empty() || !is_plain {
            return Err(BlobStoreError::InvalidPath(path.into()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let size = bytes.len();
        tokio::fs::write(&target, bytes).await?;

        tracing::debug!(path = %target.display(), size, "Stored blob");
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored object, ordered by path.
    pub fn objects(&self) -> BTreeMap<String, Vec<u8>> {
        self.objects
            .lock()
            .map(|objects| objects.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
        self.objects
            .lock()
            .map_err(|_| BlobStoreError::Poisoned)?
            .insert(path.into(), bytes);
        Ok(())
    }
}
