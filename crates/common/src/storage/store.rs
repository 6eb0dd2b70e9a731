use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("brick store error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("brick store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("brick not found: {0}")]
    NotFound(String),
    #[error("invalid brick hash: {0}")]
    InvalidHash(String),
    /// A batch fetch returned a different number of bricks than requested
    #[error("invalid data: requested {requested} bricks, got {returned}")]
    InvalidData { requested: usize, returned: usize },
}

/// Persistence for transformed brick bytes, addressed by hash
///
/// Implementations store and return bytes verbatim. Integrity checks happen
/// in the storage service, which recomputes the hash of whatever comes back.
#[async_trait]
pub trait BrickStore: Send + Sync + std::fmt::Debug {
    async fn get_brick(&self, hash: &str) -> Result<Bytes, StoreError>;

    async fn put_brick(&self, hash: &str, data: Bytes) -> Result<(), StoreError>;

    /// Fetch several bricks, preserving request order
    async fn get_multiple_bricks(&self, hashes: &[String]) -> Result<Vec<Bytes>, StoreError> {
        let mut bricks = Vec::with_capacity(hashes.len());
        for hash in hashes {
            bricks.push(self.get_brick(hash).await?);
        }
        Ok(bricks)
    }
}

// Hashes double as file names, so keep them to a safe alphabet
fn check_hash(hash: &str) -> Result<(), StoreError> {
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StoreError::InvalidHash(hash.to_string()));
    }
    Ok(())
}

/// In-memory brick store
#[derive(Debug, Clone, Default)]
pub struct MemoryBrickStore {
    inner: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryBrickStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|bricks| bricks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.inner
            .read()
            .map(|bricks| bricks.contains_key(hash))
            .unwrap_or(false)
    }

    /// Overwrite a stored brick without any checks
    pub fn corrupt(&self, hash: &str, data: Bytes) {
        if let Ok(mut bricks) = self.inner.write() {
            bricks.insert(hash.to_string(), data);
        }
    }
}

#[async_trait]
impl BrickStore for MemoryBrickStore {
    async fn get_brick(&self, hash: &str) -> Result<Bytes, StoreError> {
        let bricks = self
            .inner
            .read()
            .map_err(|e| anyhow::anyhow!("failed to acquire read lock: {}", e))?;
        bricks
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(hash.to_string()))
    }

    async fn put_brick(&self, hash: &str, data: Bytes) -> Result<(), StoreError> {
        check_hash(hash)?;
        let mut bricks = self
            .inner
            .write()
            .map_err(|e| anyhow::anyhow!("failed to acquire write lock: {}", e))?;
        bricks.insert(hash.to_string(), data);
        Ok(())
    }
}

/// Brick store over a local directory
///
/// Bricks live at `<root>/<first two hash chars>/<hash>`.
#[derive(Debug, Clone)]
pub struct FsBrickStore {
    root: PathBuf,
}

impl FsBrickStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn brick_path(&self, hash: &str) -> Result<PathBuf, StoreError> {
        check_hash(hash)?;
        let shard = hash.get(..2).unwrap_or(hash);
        Ok(self.root.join(shard).join(hash))
    }
}

#[async_trait]
impl BrickStore for FsBrickStore {
    async fn get_brick(&self, hash: &str) -> Result<Bytes, StoreError> {
        let path = self.brick_path(hash)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put_brick(&self, hash: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.brick_path(hash)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write-then-rename so readers never see a partial brick
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!("FsBrickStore::put_brick: wrote {} ({} bytes)", hash, data.len());
        Ok(())
    }
}
