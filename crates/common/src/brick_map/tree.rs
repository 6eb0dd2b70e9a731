use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::brick::{Brick, HashLink, Transform};
use crate::config::ArchiveConfig;
use crate::crypto::Secret;

use super::conflict::{self, ConflictMap};
use super::diff::{BrickMapDiff, OpType, Operation};
use super::node::{DirectoryNode, FileNode, Node, NodeKind, NodeMetadata};
use super::path;
use super::walk::Walk;
use super::{encode_brick, BrickMapError, PathTree, WireMetadata, WireTree};

/// A hierarchical tree mapping paths to ordered lists of bricks
///
/// The root is always a directory. Nodes are owned strictly hierarchically
/// and addressed only by path.
#[derive(Debug, Clone)]
pub struct BrickMap {
    header: DirectoryNode,
    encryption_key: Option<Secret>,
    config: Option<Arc<ArchiveConfig>>,
}

impl Default for BrickMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for BrickMap {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl BrickMap {
    pub fn new() -> Self {
        Self {
            header: DirectoryNode::new(Utc::now()),
            encryption_key: None,
            config: None,
        }
    }

    /// An empty tree that serializes itself under `config`
    pub fn with_config(config: Arc<ArchiveConfig>) -> Self {
        let mut map = Self::new();
        map.encryption_key = config.map_encryption_key.clone();
        map.config = Some(config);
        map
    }

    pub fn config(&self) -> Option<&Arc<ArchiveConfig>> {
        self.config.as_ref()
    }

    /// Adopt `config` (and its map key) for later serialization
    pub fn attach_config(&mut self, config: Arc<ArchiveConfig>) {
        if self.encryption_key.is_none() {
            self.encryption_key = config.map_encryption_key.clone();
        }
        self.config = Some(config);
    }

    pub fn set_encryption_key(&mut self, key: Option<Secret>) {
        self.encryption_key = key;
    }

    pub fn header(&self) -> &DirectoryNode {
        &self.header
    }

    pub fn items(&self) -> &BTreeMap<String, Node> {
        &self.header.items
    }

    /// Compare names, kinds, tombstones and hash links, ignoring timestamps
    pub fn same_structure(&self, other: &BrickMap) -> bool {
        let mut stack = vec![(&self.header.items, &other.header.items)];
        while let Some((ours, theirs)) = stack.pop() {
            if ours.len() != theirs.len() {
                return false;
            }
            for ((name_a, a), (name_b, b)) in ours.iter().zip(theirs.iter()) {
                if name_a != name_b || a.is_deleted() != b.is_deleted() {
                    return false;
                }
                match (a, b) {
                    (Node::Directory(a), Node::Directory(b)) => stack.push((&a.items, &b.items)),
                    (Node::File(a), Node::File(b)) if a.hash_links == b.hash_links => {}
                    _ => return false,
                }
            }
        }
        true
    }

    /* Reads */

    /// The node at `segments`, tombstoned or not. The root is not a node.
    fn lookup(&self, segments: &[String]) -> Option<&Node> {
        let (leaf, parents) = segments.split_last()?;
        let mut dir = &self.header;
        for segment in parents {
            match dir.items.get(segment)? {
                Node::Directory(next) => dir = next,
                Node::File(_) => return None,
            }
        }
        dir.items.get(leaf)
    }

    fn lookup_mut(&mut self, segments: &[String]) -> Option<&mut Node> {
        let (leaf, parents) = segments.split_last()?;
        let mut dir = &mut self.header;
        for segment in parents {
            match dir.items.get_mut(segment)? {
                Node::Directory(next) => dir = next,
                Node::File(_) => return None,
            }
        }
        dir.items.get_mut(leaf)
    }

    fn lookup_live(&self, segments: &[String]) -> Option<&Node> {
        self.lookup(segments).filter(|node| !node.is_deleted())
    }

    /// Whether a live node exists at `path`
    pub fn exists(&self, path: &str) -> bool {
        let segments = path::segments(path);
        segments.is_empty() || self.lookup_live(&segments).is_some()
    }

    pub fn kind(&self, path: &str) -> Option<NodeKind> {
        let segments = path::segments(path);
        if segments.is_empty() {
            return Some(NodeKind::Directory);
        }
        self.lookup_live(&segments).map(Node::kind)
    }

    pub fn get_hash_links(&self, path: &str) -> Result<&[HashLink], BrickMapError> {
        let segments = path::segments(path);
        match self.lookup_live(&segments) {
            Some(Node::File(file)) => Ok(file.hash_links.as_slice()),
            Some(Node::Directory(_)) => Err(BrickMapError::NotAFile(path::join(&segments))),
            None if segments.is_empty() => Err(BrickMapError::NotAFile(path::ROOT.to_string())),
            None => Err(BrickMapError::InvalidPath(path::join(&segments))),
        }
    }

    /// Metadata of the node at `path`, including tombstoned nodes
    pub fn get_metadata(&self, path: &str) -> Result<&NodeMetadata, BrickMapError> {
        let segments = path::segments(path);
        if segments.is_empty() {
            return Ok(&self.header.metadata);
        }
        self.lookup(&segments)
            .map(Node::metadata)
            .ok_or_else(|| BrickMapError::InvalidPath(path::join(&segments)))
    }

    /// Lazy traversal of the live nodes below the directory at `path`
    pub fn walk(&self, path: &str, recursive: bool) -> Result<Walk<'_>, BrickMapError> {
        let segments = path::segments(path);
        if segments.is_empty() {
            return Ok(Walk::new(&self.header.items, recursive));
        }
        match self.lookup_live(&segments) {
            Some(Node::Directory(dir)) => Ok(Walk::new(&dir.items, recursive)),
            Some(Node::File(_)) => Err(BrickMapError::NotADirectory(path::join(&segments))),
            None => Err(BrickMapError::InvalidPath(path::join(&segments))),
        }
    }

    /// Files below `path`, relative to it. A missing directory lists nothing.
    pub fn get_file_list(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<impl Iterator<Item = String> + '_, BrickMapError> {
        Ok(self.walk_or_empty(path, recursive)?.files())
    }

    /// Folders below `path`, relative to it. A missing directory lists nothing.
    pub fn get_folder_list(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<impl Iterator<Item = String> + '_, BrickMapError> {
        Ok(self.walk_or_empty(path, recursive)?.folders())
    }

    fn walk_or_empty(&self, path: &str, recursive: bool) -> Result<Walk<'_>, BrickMapError> {
        match self.walk(path, recursive) {
            Err(BrickMapError::InvalidPath(_)) => Ok(Walk::empty()),
            other => other,
        }
    }

    /// Whether the node at `path` has no live content
    pub fn is_empty(&self, path: &str) -> Result<bool, BrickMapError> {
        let segments = path::segments(path);
        if segments.is_empty() {
            return Ok(self.header.live_items().next().is_none());
        }
        self.lookup_live(&segments)
            .map(Node::is_empty)
            .ok_or_else(|| BrickMapError::InvalidPath(path::join(&segments)))
    }

    /// Whether `path` differs between `self` and `other` in kind, tombstone
    /// state or content. A directory that only gained or lost children below
    /// it does not count as changed.
    pub fn changed_between(&self, other: &BrickMap, path: &str) -> bool {
        let segments = path::segments(path);
        if segments.is_empty() {
            return false;
        }
        match (self.lookup(&segments), other.lookup(&segments)) {
            (None, None) => false,
            (Some(Node::Directory(a)), Some(Node::Directory(b))) => {
                a.metadata.is_deleted() != b.metadata.is_deleted()
            }
            (Some(Node::File(a)), Some(Node::File(b))) => {
                a.metadata.is_deleted() != b.metadata.is_deleted() || a.hash_links != b.hash_links
            }
            _ => true,
        }
    }

    /* Navigation for writes */

    /// Fail if a live file occupies one of the directory segments of `segments`
    fn check_parents(&self, segments: &[String]) -> Result<(), BrickMapError> {
        let Some((_, parents)) = segments.split_last() else {
            return Ok(());
        };
        let mut dir = &self.header;
        for (i, segment) in parents.iter().enumerate() {
            match dir.items.get(segment) {
                Some(Node::Directory(next)) if !next.metadata.is_deleted() => dir = next,
                Some(Node::File(file)) if !file.metadata.is_deleted() => {
                    return Err(BrickMapError::NotADirectory(path::join(&parents[..=i])));
                }
                // missing or tombstoned: created fresh below this point
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    /// Fail if a live node of the wrong kind occupies the leaf
    fn check_leaf(&self, segments: &[String], want: NodeKind) -> Result<(), BrickMapError> {
        match self.lookup_live(segments).map(Node::kind) {
            Some(NodeKind::Directory) if want == NodeKind::File => {
                Err(BrickMapError::NotAFile(path::join(segments)))
            }
            Some(NodeKind::File) if want == NodeKind::Directory => {
                Err(BrickMapError::NotADirectory(path::join(segments)))
            }
            _ => Ok(()),
        }
    }

    /// Walk to the directory holding the leaf, creating missing directories,
    /// replacing tombstoned files and resurrecting tombstoned directories.
    fn parent_for_write(
        &mut self,
        parents: &[String],
        now: DateTime<Utc>,
    ) -> Result<&mut DirectoryNode, BrickMapError> {
        let mut dir = &mut self.header;
        for (i, segment) in parents.iter().enumerate() {
            let node = dir
                .items
                .entry(segment.clone())
                .or_insert_with(|| Node::new_directory(now));
            if matches!(node, Node::File(file) if file.metadata.is_deleted()) {
                *node = Node::new_directory(now);
            }
            dir = match node {
                Node::Directory(next) => {
                    next.metadata.resurrect(now);
                    next
                }
                Node::File(_) => {
                    return Err(BrickMapError::NotADirectory(path::join(&parents[..=i])));
                }
            };
        }
        Ok(dir)
    }

    /// The file at `name` inside `parent`, created or resurrected as needed
    fn file_slot<'a>(
        parent: &'a mut DirectoryNode,
        name: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut FileNode> {
        let node = parent
            .items
            .entry(name.to_string())
            .or_insert_with(|| Node::new_file(now));
        if matches!(node, Node::Directory(dir) if dir.metadata.is_deleted()) {
            *node = Node::new_file(now);
        }
        match node {
            Node::File(file) => {
                file.metadata.resurrect(now);
                Some(file)
            }
            Node::Directory(_) => None,
        }
    }

    /* Timestamped writes, shared by the public surface and replay */

    fn write_file(
        &mut self,
        path: &str,
        hash_links: Vec<HashLink>,
        truncate: bool,
        now: DateTime<Utc>,
    ) -> Result<(), BrickMapError> {
        let segments = path::segments(path);
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(BrickMapError::NotAFile(path::ROOT.to_string()));
        };
        self.check_parents(&segments)?;
        self.check_leaf(&segments, NodeKind::File)?;

        let parent = self.parent_for_write(parents, now)?;
        let file = Self::file_slot(parent, leaf, now)
            .ok_or_else(|| BrickMapError::NotAFile(path::join(&segments)))?;
        if truncate {
            file.hash_links.clear();
        }
        file.hash_links.extend(hash_links);
        file.metadata.touch(now);
        Ok(())
    }

    fn delete_at(&mut self, path: &str, now: DateTime<Utc>) -> Result<(), BrickMapError> {
        let segments = path::segments(path);
        match self.lookup_mut(&segments) {
            Some(node) if !node.is_deleted() => {
                node.tombstone(now);
                Ok(())
            }
            _ => Err(BrickMapError::InvalidPath(path::join(&segments))),
        }
    }

    fn copy_at(&mut self, src: &str, dst: &str, now: DateTime<Utc>) -> Result<(), BrickMapError> {
        let src_segments = path::segments(src);
        let dst_segments = path::segments(dst);
        let source = self
            .lookup_live(&src_segments)
            .ok_or_else(|| BrickMapError::InvalidPath(path::join(&src_segments)))?;
        let copy = source.duplicate(now);

        let Some((leaf, parents)) = dst_segments.split_last() else {
            return Err(BrickMapError::InvalidPath(path::ROOT.to_string()));
        };
        self.check_parents(&dst_segments)?;
        self.check_leaf(&dst_segments, copy.kind())?;

        let parent = self.parent_for_write(parents, now)?;
        parent.items.insert(leaf.clone(), copy);
        Ok(())
    }

    fn create_at(
        &mut self,
        path: &str,
        kind: NodeKind,
        now: DateTime<Utc>,
    ) -> Result<(), BrickMapError> {
        let segments = path::segments(path);
        let Some((leaf, parents)) = segments.split_last() else {
            return match kind {
                NodeKind::Directory => Ok(()),
                NodeKind::File => Err(BrickMapError::NotAFile(path::ROOT.to_string())),
            };
        };
        self.check_parents(&segments)?;
        self.check_leaf(&segments, kind)?;
        if self.lookup_live(&segments).is_some() {
            return Ok(());
        }

        let parent = self.parent_for_write(parents, now)?;
        let node = match kind {
            NodeKind::Directory => Node::new_directory(now),
            NodeKind::File => Node::new_file(now),
        };
        parent.items.insert(leaf.clone(), node);
        Ok(())
    }

    fn truncate_at(&mut self, path: &str, now: DateTime<Utc>) -> Result<(), BrickMapError> {
        let segments = path::segments(path);
        if segments.is_empty() {
            self.header.items.clear();
            self.header.metadata.touch(now);
            return Ok(());
        }
        let node = self
            .lookup_mut(&segments)
            .ok_or_else(|| BrickMapError::InvalidPath(path::join(&segments)))?;
        node.truncate(now);
        Ok(())
    }

    /// Apply a single logged operation at its recorded time
    pub fn apply_operation(&mut self, operation: &Operation) -> Result<(), BrickMapError> {
        let ts = operation.timestamp;
        let path = operation.path.as_str();
        match operation.op {
            OpType::Add => {
                let links = operation.hash_links().ok_or_else(|| {
                    BrickMapError::InvalidOperation(format!("add without hash links: {}", path))
                })?;
                self.write_file(path, links.to_vec(), operation.replace, ts)
            }
            OpType::Truncate => {
                // truncating something that never existed is a no-op
                let segments = path::segments(path);
                if segments.is_empty() || self.lookup(&segments).is_some() {
                    self.truncate_at(path, ts)
                } else {
                    Ok(())
                }
            }
            OpType::Delete => self.delete_at(path, ts),
            OpType::Copy => {
                let dst = operation.destination().ok_or_else(|| {
                    BrickMapError::InvalidOperation(format!("copy without destination: {}", path))
                })?;
                self.copy_at(path, dst, ts)
            }
            OpType::CreateFolder => self.create_at(path, NodeKind::Directory, ts),
            OpType::CreateFile => self.create_at(path, NodeKind::File, ts),
        }
    }

    /* Algebra */

    /// A tree holding only the subtrees of `other` that are new or changed
    /// relative to `self`, each cloned verbatim from `other`
    pub fn diff(&self, other: &BrickMap) -> BrickMap {
        BrickMap {
            header: DirectoryNode {
                metadata: other.header.metadata.clone(),
                items: diff_items(&self.header, &other.header),
            },
            encryption_key: self.encryption_key.clone(),
            config: self.config.clone(),
        }
    }

    /// Bring every path `other` changed relative to `self` to `other`'s state
    pub fn merge(&mut self, other: &BrickMap) {
        let changes = self.diff(other);
        if changes.header.items.is_empty() {
            return;
        }
        merge_items(&mut self.header, changes.header.items);
        self.header.metadata.touch(Utc::now());
    }

    /// Check local operations against `self` as the remote truth
    pub fn detect_merge_conflicts(&self, local_diffs: &[BrickMapDiff]) -> Option<ConflictMap> {
        conflict::detect(self, local_diffs)
    }

    /* Serialization */

    pub fn to_bytes(&self) -> Result<Vec<u8>, BrickMapError> {
        let wire = WireTree {
            metadata: WireMetadata {
                node: self.header.metadata.clone(),
                log: None,
                prev: None,
            },
            items: self.header.items.clone(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BrickMapError> {
        let wire: WireTree = serde_json::from_slice(bytes)?;
        Ok(Self {
            header: DirectoryNode {
                metadata: wire.metadata.node,
                items: wire.items,
            },
            encryption_key: None,
            config: None,
        })
    }

    /// Serialize into a brick using the tree's config and key
    pub fn to_brick(&self) -> Result<Brick, BrickMapError> {
        let transform = self
            .config
            .as_ref()
            .map(|config| config.transform())
            .unwrap_or_else(Transform::identity);
        encode_brick(self.to_bytes()?, transform, self.encryption_key.as_ref())
    }

    /// Serialize into a brick under an explicit config
    pub fn to_brick_with(&self, config: &ArchiveConfig) -> Result<Brick, BrickMapError> {
        let key = self
            .encryption_key
            .as_ref()
            .or(config.map_encryption_key.as_ref());
        encode_brick(self.to_bytes()?, config.transform(), key)
    }

    /// Replace the tree's content with the one stored in `brick`
    pub fn load(&mut self, brick: &mut Brick) -> Result<(), BrickMapError> {
        let raw = brick.get_raw()?;
        let loaded = Self::from_bytes(&raw)?;
        self.header = loaded.header;
        Ok(())
    }
}

fn diff_items(base: &DirectoryNode, other: &DirectoryNode) -> BTreeMap<String, Node> {
    let mut changed = BTreeMap::new();
    for (name, theirs) in &other.items {
        let Some(ours) = base.items.get(name) else {
            changed.insert(name.clone(), theirs.clone());
            continue;
        };
        match (ours, theirs) {
            (Node::Directory(a), Node::Directory(b))
                if a.metadata.is_deleted() == b.metadata.is_deleted() =>
            {
                let nested = diff_items(a, b);
                if !nested.is_empty() {
                    changed.insert(
                        name.clone(),
                        Node::Directory(DirectoryNode {
                            metadata: b.metadata.clone(),
                            items: nested,
                        }),
                    );
                }
            }
            (Node::File(a), Node::File(b))
                if a.metadata.is_deleted() == b.metadata.is_deleted()
                    && a.hash_links == b.hash_links => {}
            _ => {
                changed.insert(name.clone(), theirs.clone());
            }
        }
    }
    changed
}

fn merge_items(target: &mut DirectoryNode, changes: BTreeMap<String, Node>) {
    for (name, incoming) in changes {
        let descend = matches!(
            (target.items.get(&name), &incoming),
            (Some(Node::Directory(ours)), Node::Directory(theirs))
                if ours.metadata.is_deleted() == theirs.metadata.is_deleted()
        );
        if !descend {
            target.items.insert(name, incoming);
            continue;
        }
        if let (Some(Node::Directory(ours)), Node::Directory(theirs)) =
            (target.items.get_mut(&name), incoming)
        {
            ours.metadata = theirs.metadata;
            merge_items(ours, theirs.items);
        }
    }
}

impl PathTree for BrickMap {
    fn add_file_entry(
        &mut self,
        path: &str,
        hash_links: Vec<HashLink>,
    ) -> Result<(), BrickMapError> {
        self.write_file(path, hash_links, true, Utc::now())
    }

    fn append_bricks_to_file(
        &mut self,
        path: &str,
        hash_links: Vec<HashLink>,
    ) -> Result<(), BrickMapError> {
        if path.is_empty() {
            return Err(BrickMapError::InvalidPath(path.to_string()));
        }
        self.write_file(path, hash_links, false, Utc::now())
    }

    fn delete(&mut self, path: &str) -> Result<(), BrickMapError> {
        self.delete_at(path, Utc::now())
    }

    fn copy(&mut self, src: &str, dst: &str) -> Result<(), BrickMapError> {
        self.copy_at(src, dst, Utc::now())
    }

    fn create_folder(&mut self, path: &str) -> Result<(), BrickMapError> {
        self.create_at(path, NodeKind::Directory, Utc::now())
    }

    fn create_file(&mut self, path: &str) -> Result<(), BrickMapError> {
        self.create_at(path, NodeKind::File, Utc::now())
    }

    fn empty_list(&mut self, path: &str) -> Result<(), BrickMapError> {
        self.truncate_at(path, Utc::now())
    }

    /// Replays onto a copy and swaps it in, so a failing operation leaves
    /// the tree untouched
    fn apply_diff(&mut self, diff: &BrickMapDiff) -> Result<(), BrickMapError> {
        let mut next = self.clone();
        for operation in diff.log() {
            next.apply_operation(operation)?;
        }
        *self = next;
        Ok(())
    }
}
