use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::brick::HashLink;

/**
 * Nodes
 * =====
 * A brick map is a tree of two kinds of nodes:
 *  - Directory nodes: a sorted map of names to child nodes
 *  - File nodes: an ordered list of links to the bricks holding the content
 * Deleting a node does not unlink it from its parent. Instead the node is
 *  tombstoned (`deletedAt` set, contents cleared) so that the deletion itself
 *  is visible to diff and merge. Any later write to the path clears the
 *  tombstone again.
 */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl NodeMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }

    pub fn resurrect(&mut self, now: DateTime<Utc>) {
        if self.deleted_at.take().is_some() {
            self.updated_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub metadata: NodeMetadata,
    pub items: BTreeMap<String, Node>,
}

impl DirectoryNode {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            metadata: NodeMetadata::new(now),
            items: BTreeMap::new(),
        }
    }

    /// Children that are not tombstoned
    pub fn live_items(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.items.iter().filter(|(_, node)| !node.is_deleted())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub metadata: NodeMetadata,
    pub hash_links: Vec<HashLink>,
}

impl FileNode {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            metadata: NodeMetadata::new(now),
            hash_links: Vec::new(),
        }
    }
}

// Directories are told apart from files by the presence of `items`
//  vs `hashLinks` in the canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Directory(DirectoryNode),
    File(FileNode),
}

impl Node {
    pub fn new_directory(now: DateTime<Utc>) -> Self {
        Node::Directory(DirectoryNode::new(now))
    }

    pub fn new_file(now: DateTime<Utc>) -> Self {
        Node::File(FileNode::new(now))
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Directory(_) => NodeKind::Directory,
            Node::File(_) => NodeKind::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Node::File(_))
    }

    pub fn metadata(&self) -> &NodeMetadata {
        match self {
            Node::Directory(dir) => &dir.metadata,
            Node::File(file) => &file.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut NodeMetadata {
        match self {
            Node::Directory(dir) => &mut dir.metadata,
            Node::File(file) => &mut file.metadata,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata().is_deleted()
    }

    /// Clear contents without touching the tombstone
    fn clear(&mut self) {
        match self {
            Node::Directory(dir) => dir.items.clear(),
            Node::File(file) => file.hash_links.clear(),
        }
    }

    /// Mark deleted and drop contents
    pub fn tombstone(&mut self, now: DateTime<Utc>) {
        self.clear();
        let metadata = self.metadata_mut();
        metadata.deleted_at = Some(now);
        metadata.updated_at = Some(now);
    }

    /// Clear tombstone and contents
    pub fn truncate(&mut self, now: DateTime<Utc>) {
        self.clear();
        let metadata = self.metadata_mut();
        metadata.deleted_at = None;
        metadata.updated_at = Some(now);
    }

    /// Whether the node has no live content
    pub fn is_empty(&self) -> bool {
        match self {
            Node::Directory(dir) => dir.live_items().next().is_none(),
            Node::File(file) => file.hash_links.is_empty(),
        }
    }

    /// Copy of this node's contents under fresh metadata
    pub fn duplicate(&self, now: DateTime<Utc>) -> Self {
        match self {
            Node::Directory(dir) => Node::Directory(DirectoryNode {
                metadata: NodeMetadata::new(now),
                items: dir.items.clone(),
            }),
            Node::File(file) => Node::File(FileNode {
                metadata: NodeMetadata::new(now),
                hash_links: file.hash_links.clone(),
            }),
        }
    }
}
