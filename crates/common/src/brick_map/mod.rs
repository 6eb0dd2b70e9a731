//! Path trees over bricks
//!
//! - **[`BrickMap`]**: a hierarchical tree of directory and file nodes, the
//!   file nodes referencing ordered lists of bricks. Supports structural
//!   edits, diffing, merging and conflict detection.
//! - **[`BrickMapDiff`]**: the same write surface, but every mutation is
//!   recorded in an operation log instead of applied. A diff can be replayed
//!   onto any brick map.
//!
//! Both implement [`PathTree`], so callers can drive either one with the same
//! sequence of writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::brick::{Brick, BrickError, HashLink, Transform, TransformParams};
use crate::crypto::Secret;

mod conflict;
mod diff;
mod node;
pub mod path;
mod tree;
mod walk;

pub use conflict::{ConflictInfo, ConflictMap, ConflictType};
pub use diff::{BrickMapDiff, OpData, OpType, Operation};
pub use node::{DirectoryNode, FileNode, Node, NodeKind, NodeMetadata};
pub use tree::BrickMap;
pub use walk::Walk;

#[derive(Debug, thiserror::Error)]
pub enum BrickMapError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("brick map is encrypted but no encryption key was provided")]
    MissingEncryptionKey,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("brick error: {0}")]
    Brick(#[from] BrickError),
}

/// The write surface shared by brick maps and diffs
///
/// Every method normalizes its path(s) first. An implementation either fully
/// applies (or records) the operation or returns an error without any
/// observable change.
pub trait PathTree {
    /// Replace the content of a file, creating it if needed
    fn add_file_entry(&mut self, path: &str, hash_links: Vec<HashLink>)
        -> Result<(), BrickMapError>;

    /// Append to a file, creating it if needed
    fn append_bricks_to_file(
        &mut self,
        path: &str,
        hash_links: Vec<HashLink>,
    ) -> Result<(), BrickMapError>;

    fn delete(&mut self, path: &str) -> Result<(), BrickMapError>;

    fn copy(&mut self, src: &str, dst: &str) -> Result<(), BrickMapError>;

    fn create_folder(&mut self, path: &str) -> Result<(), BrickMapError>;

    fn create_file(&mut self, path: &str) -> Result<(), BrickMapError>;

    /// Truncate a node: clear its tombstone and its contents
    fn empty_list(&mut self, path: &str) -> Result<(), BrickMapError>;

    /// Replay the operations recorded in `diff`
    fn apply_diff(&mut self, diff: &BrickMapDiff) -> Result<(), BrickMapError>;
}

/// Canonical byte encoding shared by brick maps and diffs
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireTree {
    pub metadata: WireMetadata,
    #[serde(default)]
    pub items: BTreeMap<String, Node>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireMetadata {
    #[serde(flatten)]
    pub node: NodeMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Vec<Operation>>,
    /// Hash of the diff this one was chained onto
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
}

/// Wrap serialized tree bytes in a brick under `transform`
pub(crate) fn encode_brick(
    bytes: Vec<u8>,
    transform: Transform,
    key: Option<&Secret>,
) -> Result<Brick, BrickMapError> {
    // a generated key would never be recoverable by a later load
    if transform.encryption().is_some() && key.is_none() {
        return Err(BrickMapError::MissingEncryptionKey);
    }
    let mut brick = Brick::from_raw(bytes, transform);
    if let Some(key) = key {
        brick.set_transform_params(TransformParams::with_key(key.clone()));
    }
    Ok(brick)
}

/// Parameters needed to read back a brick written by [`encode_brick`]
pub(crate) fn decode_params(key: Option<&Secret>) -> TransformParams {
    match key {
        Some(key) => TransformParams::with_key(key.clone()),
        None => TransformParams::default(),
    }
}
