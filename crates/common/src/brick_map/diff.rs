use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::brick::{Brick, HashLink};
use crate::config::ArchiveConfig;

use super::node::NodeMetadata;
use super::path;
use super::{encode_brick, BrickMapError, PathTree, WireMetadata, WireTree};

/// Kind of a logged tree mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpType {
    /// Append hash links to a file, creating it if needed
    Add,
    /// Clear a node's contents and tombstone
    Truncate,
    /// Tombstone a node
    Delete,
    /// Deep copy a node to `data` (the destination)
    Copy,
    CreateFolder,
    CreateFile,
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpType::Add => "add",
            OpType::Truncate => "truncate",
            OpType::Delete => "delete",
            OpType::Copy => "copy",
            OpType::CreateFolder => "createFolder",
            OpType::CreateFile => "createFile",
        };
        write!(f, "{}", name)
    }
}

/// Payload of an operation: the links for `add`, the destination for `copy`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpData {
    HashLinks(Vec<HashLink>),
    Destination(String),
}

/// A single entry of the operation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpType,
    /// Normalized target path (the source for `copy`)
    pub path: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<OpData>,
    /// `add` only: clear the file's links before appending
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replace: bool,
}

impl Operation {
    fn new(op: OpType, path: String, data: Option<OpData>) -> Self {
        Self {
            op,
            path,
            timestamp: Utc::now(),
            data,
            replace: false,
        }
    }

    pub fn hash_links(&self) -> Option<&[HashLink]> {
        match &self.data {
            Some(OpData::HashLinks(links)) => Some(links),
            _ => None,
        }
    }

    pub fn destination(&self) -> Option<&str> {
        match &self.data {
            Some(OpData::Destination(dst)) => Some(dst),
            _ => None,
        }
    }
}

/// A log of tree mutations, recorded instead of applied
///
/// Diffs are chained: `prev` names the hash of the diff (or snapshot) this
/// one was opened on top of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrickMapDiff {
    metadata: NodeMetadata,
    log: Vec<Operation>,
    prev: Option<String>,
}

impl Default for BrickMapDiff {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BrickMapDiff {
    pub fn new(prev: Option<String>) -> Self {
        Self {
            metadata: NodeMetadata::new(Utc::now()),
            log: Vec::new(),
            prev,
        }
    }

    pub fn prev(&self) -> Option<&str> {
        self.prev.as_deref()
    }

    pub fn set_prev(&mut self, prev: Option<String>) {
        self.prev = prev;
    }

    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    pub fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    /// Whether anything was recorded
    pub fn has_items(&self) -> bool {
        !self.log.is_empty()
    }

    /// Keep only the operations matching `keep`
    pub fn retain(&mut self, keep: impl FnMut(&Operation) -> bool) {
        self.log.retain(keep);
    }

    pub fn operations_mut(&mut self) -> std::slice::IterMut<'_, Operation> {
        self.log.iter_mut()
    }

    fn record(&mut self, op: OpType, path: String, data: Option<OpData>) {
        self.push(Operation::new(op, path, data));
    }

    fn push(&mut self, operation: Operation) {
        self.log.push(operation);
        self.metadata.touch(Utc::now());
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BrickMapError> {
        let wire = WireTree {
            metadata: WireMetadata {
                node: self.metadata.clone(),
                log: Some(self.log.clone()),
                prev: self.prev.clone(),
            },
            items: Default::default(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BrickMapError> {
        let wire: WireTree = serde_json::from_slice(bytes)?;
        Ok(Self {
            metadata: wire.metadata.node,
            log: wire.metadata.log.unwrap_or_default(),
            prev: wire.metadata.prev,
        })
    }

    pub fn to_brick(&self, config: &ArchiveConfig) -> Result<Brick, BrickMapError> {
        encode_brick(
            self.to_bytes()?,
            config.transform(),
            config.map_encryption_key.as_ref(),
        )
    }

    pub fn from_brick(brick: &mut Brick) -> Result<Self, BrickMapError> {
        let raw = brick.get_raw()?;
        Self::from_bytes(&raw)
    }
}

fn require_non_root(path: &str, err: fn(String) -> BrickMapError) -> Result<String, BrickMapError> {
    let normalized = path::normalize(path);
    if normalized == path::ROOT {
        return Err(err(normalized));
    }
    Ok(normalized)
}

impl PathTree for BrickMapDiff {
    fn add_file_entry(
        &mut self,
        path: &str,
        hash_links: Vec<HashLink>,
    ) -> Result<(), BrickMapError> {
        let path = require_non_root(path, BrickMapError::NotAFile)?;
        // one op, so a tombstone at `path` is replaced rather than revived
        let mut operation =
            Operation::new(OpType::Add, path, Some(OpData::HashLinks(hash_links)));
        operation.replace = true;
        self.push(operation);
        Ok(())
    }

    fn append_bricks_to_file(
        &mut self,
        path: &str,
        hash_links: Vec<HashLink>,
    ) -> Result<(), BrickMapError> {
        if path.is_empty() {
            return Err(BrickMapError::InvalidPath(path.to_string()));
        }
        let path = require_non_root(path, BrickMapError::NotAFile)?;
        self.record(OpType::Add, path, Some(OpData::HashLinks(hash_links)));
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<(), BrickMapError> {
        let path = require_non_root(path, BrickMapError::InvalidPath)?;
        self.record(OpType::Delete, path, None);
        Ok(())
    }

    fn copy(&mut self, src: &str, dst: &str) -> Result<(), BrickMapError> {
        let src = require_non_root(src, BrickMapError::InvalidPath)?;
        let dst = require_non_root(dst, BrickMapError::InvalidPath)?;
        self.record(OpType::Copy, src, Some(OpData::Destination(dst)));
        Ok(())
    }

    fn create_folder(&mut self, path: &str) -> Result<(), BrickMapError> {
        let path = path::normalize(path);
        if path == path::ROOT {
            return Ok(());
        }
        self.record(OpType::CreateFolder, path, None);
        Ok(())
    }

    fn create_file(&mut self, path: &str) -> Result<(), BrickMapError> {
        let path = require_non_root(path, BrickMapError::NotAFile)?;
        self.record(OpType::CreateFile, path, None);
        Ok(())
    }

    fn empty_list(&mut self, path: &str) -> Result<(), BrickMapError> {
        self.record(OpType::Truncate, path::normalize(path), None);
        Ok(())
    }

    fn apply_diff(&mut self, diff: &BrickMapDiff) -> Result<(), BrickMapError> {
        self.log.extend(diff.log.iter().cloned());
        self.metadata.touch(Utc::now());
        Ok(())
    }
}
