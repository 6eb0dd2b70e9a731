//! File-level access to an archive
//!
//! [`Archive`] pairs a [`BrickMapController`] with the storage service its
//! strategy context already carries: content goes through the storage
//! service, the resulting hash links through the controller.

use std::path::Path;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::brick::HashLink;
use crate::brick_map::path;
use crate::controller::{AnchorReceipt, BrickMapController, ControllerError, TreeMutator};
use crate::storage::{BrickStorageService, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct Archive {
    controller: BrickMapController,
    storage: BrickStorageService,
}

impl Archive {
    pub fn new(controller: BrickMapController) -> Self {
        let storage = controller.context().storage.clone();
        Self {
            controller,
            storage,
        }
    }

    pub fn controller(&self) -> &BrickMapController {
        &self.controller
    }

    pub fn storage(&self) -> &BrickStorageService {
        &self.storage
    }

    /* Writes */

    /// Store `data` and point `path` at it, replacing previous content
    pub async fn write_file(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Result<Option<AnchorReceipt>, ArchiveError> {
        let links = self.ingest(data.into()).await?;
        Ok(self.controller.add_file(path, links).await?)
    }

    pub async fn append_file(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Result<Option<AnchorReceipt>, ArchiveError> {
        let links = self.ingest(data.into()).await?;
        Ok(self.controller.append_to_file(path, links).await?)
    }

    async fn ingest(&self, data: Bytes) -> Result<Vec<HashLink>, StorageError> {
        let summaries = self.storage.ingest_buffer(data, None).await?;
        Ok(summaries.into_iter().map(HashLink::from).collect())
    }

    /// Ingest a local file block by block
    pub async fn add_file_from_fs(
        &self,
        source: &Path,
        path: &str,
    ) -> Result<Option<AnchorReceipt>, ArchiveError> {
        let summaries = self.storage.ingest_file(source, None).await?;
        let links = summaries.into_iter().map(HashLink::from).collect();
        Ok(self.controller.add_file(path, links).await?)
    }

    /// Compact every file below `source` into one brick and add them all
    /// beneath `path` in a single write
    pub async fn add_folder_from_fs(
        &self,
        source: &Path,
        path: &str,
    ) -> Result<Option<AnchorReceipt>, ArchiveError> {
        let compacted = self.storage.create_brick_from_folder(source).await?;
        tracing::debug!(
            "Archive::add_folder_from_fs: {} file(s) from {:?} into {}",
            compacted.len(),
            source,
            path
        );
        if compacted.is_empty() {
            return Ok(self.controller.create_directory(path).await?);
        }
        let files = compacted
            .into_iter()
            .map(|file| {
                let target = path::normalize(&format!("{}/{}", path, file.path));
                (target, vec![HashLink::from(file.summary)])
            })
            .collect();
        Ok(self.controller.add_files(files).await?)
    }

    pub async fn delete(&self, path: &str) -> Result<Option<AnchorReceipt>, ArchiveError> {
        Ok(self.controller.delete_file(path).await?)
    }

    pub async fn rename(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<AnchorReceipt>, ArchiveError> {
        Ok(self.controller.rename_file(src, dst).await?)
    }

    pub async fn mkdir(&self, path: &str) -> Result<Option<AnchorReceipt>, ArchiveError> {
        Ok(self.controller.create_directory(path).await?)
    }

    /* Reads */

    pub async fn read_file(&self, path: &str) -> Result<Bytes, ArchiveError> {
        let links = self.controller.get_hash_links(path).await?;
        Ok(self.storage.create_buffer_from_bricks(&links).await?)
    }

    pub async fn read_stream(
        &self,
        path: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StorageError>>, ArchiveError> {
        let links = self.controller.get_hash_links(path).await?;
        Ok(self.storage.create_stream_from_bricks(links))
    }

    /// Write a file's content out to `target`, returning the bytes written
    pub async fn extract_file(&self, path: &str, target: &Path) -> Result<u64, ArchiveError> {
        let links = self.controller.get_hash_links(path).await?;
        Ok(self.storage.create_file_from_bricks(target, &links).await?)
    }

    pub async fn list_files(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<String>, ArchiveError> {
        Ok(self.controller.get_file_list(path, recursive).await?)
    }

    pub async fn list_folders(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<String>, ArchiveError> {
        Ok(self.controller.get_folder_list(path, recursive).await?)
    }
}
