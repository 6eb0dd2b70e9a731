use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::diff::{BrickMapDiff, OpType};
use super::tree::BrickMap;

/// How a local operation collides with the remote tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// A local write targets a path that exists remotely
    LocalOverwrite,
    /// A local copy reads from a path the remote no longer has
    RemoteDelete,
    /// A local delete targets a path that still exists remotely
    LocalDelete,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::LocalOverwrite => write!(f, "LOCAL_OVERWRITE"),
            ConflictType::RemoteDelete => write!(f, "REMOTE_DELETE"),
            ConflictType::LocalDelete => write!(f, "LOCAL_DELETE"),
        }
    }
}

/// Describes one conflicting path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub conflict_type: ConflictType,
    /// The local operation that produced the conflict
    pub op: OpType,
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

/// Conflicts keyed by normalized path
pub type ConflictMap = BTreeMap<String, ConflictInfo>;

/// Check every logged operation in `diffs` against `remote`
///
/// Later operations on the same path replace earlier entries, so each path
/// is reported at most once.
pub(crate) fn detect(remote: &BrickMap, diffs: &[BrickMapDiff]) -> Option<ConflictMap> {
    let mut conflicts = ConflictMap::new();
    let mut flag = |conflict_type: ConflictType, op: OpType, path: &str, ts: DateTime<Utc>| {
        conflicts.insert(
            path.to_string(),
            ConflictInfo {
                conflict_type,
                op,
                path: path.to_string(),
                timestamp: ts,
            },
        );
    };

    for operation in diffs.iter().flat_map(|diff| diff.log()) {
        let path = operation.path.as_str();
        match operation.op {
            OpType::Add | OpType::Truncate | OpType::CreateFolder | OpType::CreateFile => {
                if remote.exists(path) {
                    flag(
                        ConflictType::LocalOverwrite,
                        operation.op,
                        path,
                        operation.timestamp,
                    );
                }
            }
            OpType::Copy => {
                if let Some(dst) = operation.destination() {
                    if remote.exists(dst) {
                        flag(
                            ConflictType::LocalOverwrite,
                            operation.op,
                            dst,
                            operation.timestamp,
                        );
                    }
                }
                if !remote.exists(path) {
                    flag(
                        ConflictType::RemoteDelete,
                        operation.op,
                        path,
                        operation.timestamp,
                    );
                }
            }
            OpType::Delete => {
                if remote.exists(path) {
                    flag(
                        ConflictType::LocalDelete,
                        operation.op,
                        path,
                        operation.timestamp,
                    );
                }
            }
        }
    }

    if conflicts.is_empty() {
        None
    } else {
        Some(conflicts)
    }
}
