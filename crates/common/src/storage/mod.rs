//! Brick persistence and the chunking pipeline
//!
//! - [`BrickStore`]: where transformed brick bytes live, keyed by hash
//! - [`FsAdapter`]: the filesystem access ingestion and extraction go through
//! - [`BrickStorageService`]: turns buffers, files and streams into bricks
//!   and back, including compaction of small files into one brick

mod fs;
mod service;
mod store;

pub use fs::{FsAdapter, FsEntry, LocalFsAdapter};
pub use service::{BrickStorageService, BrickSummary, CompactedFile, StorageError};
pub use store::{BrickStore, FsBrickStore, MemoryBrickStore, StoreError};
