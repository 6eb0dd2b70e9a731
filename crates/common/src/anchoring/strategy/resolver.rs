//! Conflict resolution for lost anchoring races
//!
//! When another writer anchored first and the local diffs collide with what
//! it wrote, a resolver rewrites the local diffs so they apply cleanly on
//! top of the remote tree.
//!
//! # Built-in Strategies
//!
//! - **[`RemoteWins`]**: drop every local operation touching a conflicting path
//! - **[`LocalWins`]**: keep every local operation that still applies
//! - **[`ConflictFile`]**: keep the remote file and move the local write to
//!   `<name>@<timestamp>.<ext>` next to it

use std::fmt::Debug;

use crate::brick_map::{
    path, BrickMap, BrickMapDiff, ConflictMap, ConflictType, OpData, OpType, Operation,
};

/// Rewrites local diffs so they can be replayed onto `remote`
pub trait ConflictResolver: Debug + Send + Sync {
    /// # Arguments
    ///
    /// * `remote` - The tree as currently anchored
    /// * `local` - Local diffs not yet anchored, oldest first
    /// * `conflicts` - The conflicting paths
    ///
    /// # Returns
    ///
    /// The diffs to anchor instead of `local`. They must apply to `remote`.
    fn resolve(
        &self,
        remote: &BrickMap,
        local: &[BrickMapDiff],
        conflicts: &ConflictMap,
    ) -> anyhow::Result<Vec<BrickMapDiff>>;
}

/// Keep the operations matching `keep` that also apply in order onto `remote`
fn keep_applicable(
    remote: &BrickMap,
    local: Vec<BrickMapDiff>,
    mut keep: impl FnMut(&Operation) -> bool,
) -> Vec<BrickMapDiff> {
    let mut probe = remote.clone();
    let mut out = Vec::with_capacity(local.len());
    for mut diff in local {
        diff.retain(|op| {
            if !keep(op) {
                return false;
            }
            match probe.apply_operation(op) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("keep_applicable: dropping {} {}: {}", op.op, op.path, e);
                    false
                }
            }
        });
        out.push(diff);
    }
    out
}

fn touches(op: &Operation, conflicts: &ConflictMap) -> bool {
    conflicts.contains_key(&op.path)
        || op
            .destination()
            .is_some_and(|dst| conflicts.contains_key(dst))
}

/// The remote tree wins every conflict
#[derive(Debug, Clone, Default)]
pub struct RemoteWins;

impl RemoteWins {
    pub fn new() -> Self {
        Self
    }
}

impl ConflictResolver for RemoteWins {
    fn resolve(
        &self,
        remote: &BrickMap,
        local: &[BrickMapDiff],
        conflicts: &ConflictMap,
    ) -> anyhow::Result<Vec<BrickMapDiff>> {
        Ok(keep_applicable(remote, local.to_vec(), |op| {
            !touches(op, conflicts)
        }))
    }
}

/// Local operations win over the remote tree
///
/// Operations that can no longer apply at all (a copy whose source the remote
/// removed, say) are dropped.
#[derive(Debug, Clone, Default)]
pub struct LocalWins;

impl LocalWins {
    pub fn new() -> Self {
        Self
    }
}

impl ConflictResolver for LocalWins {
    fn resolve(
        &self,
        remote: &BrickMap,
        local: &[BrickMapDiff],
        _conflicts: &ConflictMap,
    ) -> anyhow::Result<Vec<BrickMapDiff>> {
        Ok(keep_applicable(remote, local.to_vec(), |_| true))
    }
}

/// Keep both versions of an overwritten file
///
/// The remote file keeps its path and the local write lands at
/// `<stem>@<millis>.<ext>`, the timestamp being that of the local operation.
/// Local deletes of remotely changed paths are dropped.
#[derive(Debug, Clone, Default)]
pub struct ConflictFile;

impl ConflictFile {
    pub fn new() -> Self {
        Self
    }

    /// Format: `<stem>@<timestamp>.<ext>` or `<stem>@<timestamp>` if no extension
    pub fn conflict_path(path: &str, timestamp: i64) -> String {
        let mut segments = path::segments(path);
        let Some(name) = segments.pop() else {
            return path::ROOT.to_string();
        };
        let renamed = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{}@{}.{}", stem, timestamp, ext),
            _ => format!("{}@{}", name, timestamp),
        };
        segments.push(renamed);
        path::join(&segments)
    }
}

impl ConflictResolver for ConflictFile {
    fn resolve(
        &self,
        remote: &BrickMap,
        local: &[BrickMapDiff],
        conflicts: &ConflictMap,
    ) -> anyhow::Result<Vec<BrickMapDiff>> {
        let renamed = |target: &str| -> Option<String> {
            let info = conflicts.get(target)?;
            (info.conflict_type == ConflictType::LocalOverwrite)
                .then(|| Self::conflict_path(target, info.timestamp.timestamp_millis()))
        };

        let mut rewritten = local.to_vec();
        for diff in rewritten.iter_mut() {
            for op in diff.operations_mut() {
                match op.op {
                    OpType::Add | OpType::Truncate | OpType::CreateFile => {
                        if let Some(new_path) = renamed(&op.path) {
                            op.path = new_path;
                        }
                    }
                    OpType::Copy => {
                        if let Some(new_dst) = op.destination().and_then(renamed) {
                            op.data = Some(OpData::Destination(new_dst));
                        }
                    }
                    OpType::Delete | OpType::CreateFolder => {}
                }
            }
        }

        Ok(keep_applicable(remote, rewritten, |op| {
            !matches!(op.op, OpType::Delete | OpType::CreateFolder) || !touches(op, conflicts)
        }))
    }
}
