use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use lru::LruCache;
use parking_lot::Mutex;

use crate::brick::{
    content_hash, Brick, BrickError, BrickId, BrickIdError, HashLink, TransformParams,
};
use crate::config::ArchiveConfig;
use crate::crypto::Secret;

use super::fs::{FsAdapter, FsEntry};
use super::store::{BrickStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("brick error: {0}")]
    Brick(BrickError),
    #[error("brick id error: {0}")]
    BrickId(#[from] BrickIdError),
    /// Fetched content does not match what was asked for
    #[error("invalid data for {id}: {reason}")]
    InvalidData { id: String, reason: String },
}

impl From<BrickError> for StorageError {
    fn from(err: BrickError) -> Self {
        match err {
            BrickError::InvalidData { expected, actual } => StorageError::InvalidData {
                id: expected,
                reason: format!("content hashes to {}", actual),
            },
            other => StorageError::Brick(other),
        }
    }
}

/// What ingestion reports for each brick it wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrickSummary {
    /// Brick id, possibly carrying an embedded hint
    pub hash: String,
    /// Hash of the raw bytes this summary covers
    pub checksum: String,
    /// Raw size in bytes
    pub size: usize,
    pub key: Option<Secret>,
}

impl From<BrickSummary> for HashLink {
    fn from(summary: BrickSummary) -> Self {
        HashLink::new(summary.hash, summary.checksum, summary.key)
    }
}

/// A file packed into a compacted brick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedFile {
    /// The file's path as given, or relative to the compacted folder
    pub path: String,
    pub summary: BrickSummary,
}

/// Chunks content into bricks, stores them and reassembles them
///
/// Every brick read back is verified against its hash before decoding, and
/// every slice handed out is verified against the link's checksum. Decoded
/// payloads are cached by base brick hash, so all files compacted into one
/// brick share a single cache entry.
#[derive(Debug, Clone)]
pub struct BrickStorageService {
    store: Arc<dyn BrickStore>,
    fs: Arc<dyn FsAdapter>,
    config: Arc<ArchiveConfig>,
    cache: Arc<Mutex<LruCache<String, Bytes>>>,
}

impl BrickStorageService {
    pub fn new(
        store: Arc<dyn BrickStore>,
        fs: Arc<dyn FsAdapter>,
        config: Arc<ArchiveConfig>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.brick_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            fs,
            config,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn config(&self) -> &Arc<ArchiveConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BrickStore> {
        &self.store
    }

    pub fn fs(&self) -> &Arc<dyn FsAdapter> {
        &self.fs
    }

    fn block_size(&self, requested: Option<usize>) -> Result<usize, StorageError> {
        match requested.unwrap_or(self.config.buffer_size) {
            0 => Err(anyhow::anyhow!("block size must be positive").into()),
            size => Ok(size),
        }
    }

    /* Bricks */

    /// Store a fully formed brick, returning its hash
    pub async fn put_brick(&self, brick: &mut Brick) -> Result<String, StorageError> {
        let hash = brick.get_hash()?;
        let transformed = brick.get_transformed()?;
        self.store.put_brick(&hash, transformed).await?;
        Ok(hash)
    }

    /// Fetch and verify a brick; `params` must allow decoding it
    pub async fn get_brick(
        &self,
        hash: &str,
        params: TransformParams,
    ) -> Result<Brick, StorageError> {
        let stored = self.store.get_brick(hash).await?;
        Ok(Brick::from_stored(
            hash,
            stored,
            self.config.transform(),
            params,
        )?)
    }

    async fn persist(&self, raw: Bytes) -> Result<BrickSummary, StorageError> {
        let size = raw.len();
        let mut brick = Brick::from_raw(raw, self.config.transform());
        let hash = brick.get_hash()?;
        let checksum = brick.checksum()?;
        let transformed = brick.get_transformed()?;
        self.store.put_brick(&hash, transformed).await?;
        tracing::debug!(
            "BrickStorageService::persist: stored brick {} ({} raw bytes)",
            hash,
            size
        );
        Ok(BrickSummary {
            hash,
            checksum,
            size,
            key: brick.get_transform_params().key.clone(),
        })
    }

    /* Ingestion */

    /// Split a buffer into `ceil(len / block_size)` bricks
    pub async fn ingest_buffer(
        &self,
        data: Bytes,
        block_size: Option<usize>,
    ) -> Result<Vec<BrickSummary>, StorageError> {
        let block = self.block_size(block_size)?;
        let blocks: Vec<Bytes> = (0..data.len())
            .step_by(block)
            .map(|start| data.slice(start..(start + block).min(data.len())))
            .collect();
        // independent writes; try_join_all keeps position order
        futures::future::try_join_all(blocks.into_iter().map(|raw| self.persist(raw))).await
    }

    /// Like [`Self::ingest_buffer`], reading one block at a time from disk
    pub async fn ingest_file(
        &self,
        path: &Path,
        block_size: Option<usize>,
    ) -> Result<Vec<BrickSummary>, StorageError> {
        let block = self.block_size(block_size)?;
        let size = self.fs.get_file_size(path).await?;
        tracing::debug!(
            "BrickStorageService::ingest_file: {:?} ({} bytes, block size {})",
            path,
            size,
            block
        );
        let mut summaries = Vec::new();
        for start in (0..size).step_by(block) {
            let end = (start + block as u64).min(size);
            let raw = self.fs.read_block(path, start, end).await?;
            summaries.push(self.persist(raw).await?);
        }
        Ok(summaries)
    }

    /// Buffer a stream into full blocks, flushing the remainder at the end
    ///
    /// The source is not polled while a block is being persisted.
    pub async fn ingest_stream<S>(
        &self,
        mut source: S,
        block_size: Option<usize>,
    ) -> Result<Vec<BrickSummary>, StorageError>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let block = self.block_size(block_size)?;
        let mut buffer = BytesMut::new();
        let mut summaries = Vec::new();
        while let Some(chunk) = source.next().await {
            buffer.extend_from_slice(&chunk?);
            while buffer.len() >= block {
                let raw = buffer.split_to(block).freeze();
                summaries.push(self.persist(raw).await?);
            }
        }
        if !buffer.is_empty() {
            summaries.push(self.persist(buffer.freeze()).await?);
        }
        Ok(summaries)
    }

    /* Compaction */

    /// Pack several small payloads into a single brick
    ///
    /// Each returned summary addresses its file as a byte range of the
    /// shared brick's decoded payload.
    pub async fn create_brick_from_buffers(
        &self,
        files: Vec<(String, Bytes)>,
    ) -> Result<Vec<CompactedFile>, StorageError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let mut payload = BytesMut::new();
        let mut spans = Vec::with_capacity(files.len());
        for (path, data) in &files {
            spans.push((path.clone(), payload.len() as u64, data.len(), content_hash(data)));
            payload.extend_from_slice(data);
        }

        let base = self.persist(payload.freeze()).await?;
        tracing::debug!(
            "BrickStorageService::create_brick_from_buffers: packed {} files into {}",
            spans.len(),
            base.hash
        );
        Ok(spans
            .into_iter()
            .map(|(path, offset, size, checksum)| CompactedFile {
                path,
                summary: BrickSummary {
                    hash: BrickId::embedded(base.hash.clone(), offset, size as u64).to_string(),
                    checksum,
                    size,
                    key: base.key.clone(),
                },
            })
            .collect())
    }

    async fn read_whole(&self, path: &Path) -> Result<Bytes, StorageError> {
        let size = self.fs.get_file_size(path).await?;
        Ok(self.fs.read_block(path, 0, size).await?)
    }

    /// Compact the given files, in order
    pub async fn create_brick_from_files(
        &self,
        files: &[PathBuf],
    ) -> Result<Vec<CompactedFile>, StorageError> {
        let mut buffers = Vec::with_capacity(files.len());
        for path in files {
            buffers.push((path.to_string_lossy().into_owned(), self.read_whole(path).await?));
        }
        self.create_brick_from_buffers(buffers).await
    }

    /// Compact every file below `root`, sorted by relative path
    pub async fn create_brick_from_folder(
        &self,
        root: &Path,
    ) -> Result<Vec<CompactedFile>, StorageError> {
        let mut entries: Vec<FsEntry> = self.fs.list_files(root).try_collect().await?;
        entries.sort();
        let mut buffers = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut path = root.to_path_buf();
            path.extend(entry.dirname.split('/').filter(|s| !s.is_empty()));
            path.push(&entry.filename);
            buffers.push((entry.relative_path(), self.read_whole(&path).await?));
        }
        self.create_brick_from_buffers(buffers).await
    }

    /* Egress */

    fn cached(&self, base: &str) -> Option<Bytes> {
        self.cache.lock().get(base).cloned()
    }

    fn remember(&self, base: &str, raw: Bytes) {
        self.cache.lock().put(base.to_string(), raw);
    }

    fn decode(
        &self,
        base: &str,
        stored: Bytes,
        key: Option<&Secret>,
    ) -> Result<Bytes, StorageError> {
        let params = key
            .map(|key| TransformParams::with_key(key.clone()))
            .unwrap_or_default();
        let mut brick = Brick::from_stored(base, stored, self.config.transform(), params)?;
        Ok(brick.get_raw()?)
    }

    /// Cut the linked range out of a decoded payload and verify it
    fn slice(link: &HashLink, id: &BrickId, raw: Bytes) -> Result<Bytes, StorageError> {
        let data = match id.hint() {
            Some(hint) => {
                let range = match hint.range() {
                    Some(range) if range.end <= raw.len() => range,
                    _ => {
                        return Err(StorageError::InvalidData {
                            id: link.hash.clone(),
                            reason: format!("hint exceeds payload of {} bytes", raw.len()),
                        })
                    }
                };
                raw.slice(range)
            }
            None => raw,
        };
        let actual = content_hash(&data);
        if actual != link.checksum {
            return Err(StorageError::InvalidData {
                id: link.hash.clone(),
                reason: format!("checksum {} does not match {}", actual, link.checksum),
            });
        }
        Ok(data)
    }

    /// Fetch the content one hash link points at
    pub async fn fetch_link(&self, link: &HashLink) -> Result<Bytes, StorageError> {
        let id = link.brick_id()?;
        let raw = match self.cached(id.hash()) {
            Some(raw) => raw,
            None => {
                let stored = self.store.get_brick(id.hash()).await?;
                let raw = self.decode(id.hash(), stored, link.key.as_ref())?;
                self.remember(id.hash(), raw.clone());
                raw
            }
        };
        Self::slice(link, &id, raw)
    }

    /// Reassemble the content behind `links`, in order
    pub async fn create_buffer_from_bricks(
        &self,
        links: &[HashLink],
    ) -> Result<Bytes, StorageError> {
        let ids = links
            .iter()
            .map(HashLink::brick_id)
            .collect::<Result<Vec<_>, _>>()?;

        let mut payloads: HashMap<String, Bytes> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        let mut keys: Vec<Option<&Secret>> = Vec::new();
        for (link, id) in links.iter().zip(&ids) {
            let base = id.hash();
            if payloads.contains_key(base) || missing.iter().any(|m| m == base) {
                continue;
            }
            match self.cached(base) {
                Some(raw) => {
                    payloads.insert(base.to_string(), raw);
                }
                None => {
                    missing.push(base.to_string());
                    keys.push(link.key.as_ref());
                }
            }
        }

        if !missing.is_empty() {
            let fetched = self.store.get_multiple_bricks(&missing).await?;
            if fetched.len() != missing.len() {
                return Err(StorageError::InvalidData {
                    id: missing.join(","),
                    reason: format!("requested {} bricks, got {}", missing.len(), fetched.len()),
                });
            }
            for ((base, stored), key) in missing.iter().zip(fetched).zip(keys) {
                let raw = self.decode(base, stored, key)?;
                self.remember(base, raw.clone());
                payloads.insert(base.clone(), raw);
            }
        }

        let mut out = BytesMut::new();
        for (link, id) in links.iter().zip(&ids) {
            let raw = payloads.get(id.hash()).cloned().ok_or_else(|| {
                StorageError::InvalidData {
                    id: link.hash.clone(),
                    reason: "brick missing from batch".to_string(),
                }
            })?;
            out.extend_from_slice(&Self::slice(link, id, raw)?);
        }
        Ok(out.freeze())
    }

    /// Lazily fetch the content behind `links`, one item per link
    pub fn create_stream_from_bricks(
        &self,
        links: Vec<HashLink>,
    ) -> BoxStream<'static, Result<Bytes, StorageError>> {
        let service = self.clone();
        stream::iter(links)
            .then(move |link| {
                let service = service.clone();
                async move { service.fetch_link(&link).await }
            })
            .boxed()
    }

    /// Append the content behind `links` to the file at `path`
    pub async fn create_file_from_bricks(
        &self,
        path: &Path,
        links: &[HashLink],
    ) -> Result<u64, StorageError> {
        let mut written = 0u64;
        for link in links {
            let data = self.fetch_link(link).await?;
            self.fs.append_block(path, &data).await?;
            written += data.len() as u64;
        }
        tracing::debug!(
            "BrickStorageService::create_file_from_bricks: wrote {} bytes to {:?}",
            written,
            path
        );
        Ok(written)
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;

    use super::*;
    use crate::storage::{LocalFsAdapter, MemoryBrickStore};

    fn service_with(store: Arc<dyn BrickStore>, config: ArchiveConfig) -> BrickStorageService {
        BrickStorageService::new(store, Arc::new(LocalFsAdapter), Arc::new(config))
    }

    fn links(summaries: Vec<BrickSummary>) -> Vec<HashLink> {
        summaries.into_iter().map(HashLink::from).collect()
    }

    #[tokio::test]
    async fn test_tampered_brick_is_invalid_data() {
        let store = MemoryBrickStore::new();
        let service = service_with(Arc::new(store.clone()), ArchiveConfig::default());
        let summaries = service
            .ingest_buffer(Bytes::from_static(b"original"), None)
            .await
            .unwrap();
        store.corrupt(&summaries[0].hash, Bytes::from_static(b"tampered"));

        let result = service.create_buffer_from_bricks(&links(summaries)).await;
        assert!(matches!(result, Err(StorageError::InvalidData { .. })));
    }

    #[derive(Debug)]
    struct ShortStore(MemoryBrickStore);

    #[async_trait]
    impl BrickStore for ShortStore {
        async fn get_brick(&self, hash: &str) -> Result<Bytes, StoreError> {
            self.0.get_brick(hash).await
        }

        async fn put_brick(&self, hash: &str, data: Bytes) -> Result<(), StoreError> {
            self.0.put_brick(hash, data).await
        }

        async fn get_multiple_bricks(&self, hashes: &[String]) -> Result<Vec<Bytes>, StoreError> {
            let mut bricks = self.0.get_multiple_bricks(hashes).await?;
            bricks.pop();
            Ok(bricks)
        }
    }

    #[tokio::test]
    async fn test_short_batch_is_invalid_data() {
        let service = service_with(
            Arc::new(ShortStore(MemoryBrickStore::new())),
            ArchiveConfig::default(),
        );
        let summaries = service
            .ingest_buffer(Bytes::from_static(b"0123456789"), Some(4))
            .await
            .unwrap();
        let result = service.create_buffer_from_bricks(&links(summaries)).await;
        assert!(matches!(result, Err(StorageError::InvalidData { .. })));
    }

    #[tokio::test]
    async fn test_compacted_files_share_cache_entry() {
        let store = MemoryBrickStore::new();
        let service = service_with(Arc::new(store.clone()), ArchiveConfig::default());
        let packed = service
            .create_brick_from_buffers(vec![
                ("a".into(), Bytes::from_static(b"alpha")),
                ("b".into(), Bytes::from_static(b"bravo!")),
            ])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        let a = HashLink::from(packed[0].summary.clone());
        let b = HashLink::from(packed[1].summary.clone());
        assert_eq!(service.fetch_link(&a).await.unwrap().as_ref(), b"alpha");
        assert_eq!(service.cache.lock().len(), 1);
        assert_eq!(service.fetch_link(&b).await.unwrap().as_ref(), b"bravo!");
        assert_eq!(service.cache.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_hints_are_invalid_data() {
        let service = service_with(Arc::new(MemoryBrickStore::new()), ArchiveConfig::default());
        let summaries = service
            .ingest_buffer(Bytes::from_static(b"payload"), None)
            .await
            .unwrap();
        let base = &summaries[0].hash;

        for hint in ["18446744073709551615,2", "3,18446744073709551615", "5,10"] {
            let link = HashLink::new(format!("{}#hint=embedded/{}", base, hint), "x", None);
            assert!(matches!(
                service.fetch_link(&link).await,
                Err(StorageError::InvalidData { .. })
            ));
            assert!(matches!(
                service.create_buffer_from_bricks(&[link]).await,
                Err(StorageError::InvalidData { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_zero_block_size_rejected() {
        let service = service_with(Arc::new(MemoryBrickStore::new()), ArchiveConfig::default());
        let result = service.ingest_buffer(Bytes::from_static(b"x"), Some(0)).await;
        assert!(matches!(result, Err(StorageError::Default(_))));
    }
}
