use std::fmt::{self, Debug};

use crate::brick_map::{path, BrickMap};

/// The controller write a validator is asked about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    AddFile,
    AppendToFile,
    DeleteFile,
    CreateDirectory,
    CreateFile,
    /// Asked once for the source and once for the destination
    RenameFile,
    /// Asked for the destination only
    CopyFile,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteOp::AddFile => "add_file",
            WriteOp::AppendToFile => "append_to_file",
            WriteOp::DeleteFile => "delete_file",
            WriteOp::CreateDirectory => "create_directory",
            WriteOp::CreateFile => "create_file",
            WriteOp::RenameFile => "rename_file",
            WriteOp::CopyFile => "copy_file",
        };
        write!(f, "{}", name)
    }
}

/// Pre-write hook; an error vetoes the write before anything changes
pub trait WriteValidator: Debug + Send + Sync {
    fn validate(&self, op: WriteOp, path: &str, dirty: &BrickMap) -> anyhow::Result<()>;
}

/// Reject writes at or below any of the given paths
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyPrefixes {
    prefixes: Vec<String>,
}

impl ReadOnlyPrefixes {
    pub fn new<S: AsRef<str>>(prefixes: impl IntoIterator<Item = S>) -> Self {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| path::normalize(p.as_ref()))
                .collect(),
        }
    }
}

impl WriteValidator for ReadOnlyPrefixes {
    fn validate(&self, op: WriteOp, target: &str, _dirty: &BrickMap) -> anyhow::Result<()> {
        match self.prefixes.iter().find(|p| path::is_within(target, p)) {
            Some(prefix) => anyhow::bail!("{} of {} under read-only {}", op, target, prefix),
            None => Ok(()),
        }
    }
}
