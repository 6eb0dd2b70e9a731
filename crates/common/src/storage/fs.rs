use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// A file found while iterating a directory tree
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FsEntry {
    /// `/`-separated directory relative to the iteration root, empty at the root
    pub dirname: String,
    pub filename: String,
}

impl FsEntry {
    /// `dirname/filename`, relative to the iteration root
    pub fn relative_path(&self) -> String {
        if self.dirname.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.dirname, self.filename)
        }
    }
}

/// Filesystem access used by the storage service
#[async_trait]
pub trait FsAdapter: Send + Sync + std::fmt::Debug {
    async fn get_file_size(&self, path: &Path) -> std::io::Result<u64>;

    /// Read bytes `start..end` of a file
    async fn read_block(&self, path: &Path, start: u64, end: u64) -> std::io::Result<Bytes>;

    /// Append to a file, creating it if needed
    async fn append_block(&self, path: &Path, data: &[u8]) -> std::io::Result<()>;

    /// Lazily iterate every regular file below `root`
    ///
    /// Each call starts a fresh traversal.
    fn list_files(&self, root: &Path) -> BoxStream<'static, std::io::Result<FsEntry>>;
}

/// [`FsAdapter`] over the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFsAdapter;

struct ListState {
    root: PathBuf,
    pending: Vec<PathBuf>,
    current: Option<(PathBuf, tokio::fs::ReadDir)>,
}

fn relative_dirname(root: &Path, dir: &Path) -> String {
    dir.strip_prefix(root)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

/// Advance a directory listing to its next regular file
async fn next_file(mut state: ListState) -> std::io::Result<Option<(FsEntry, ListState)>> {
    loop {
        if let Some((dir, entries)) = state.current.as_mut() {
            match entries.next_entry().await? {
                Some(entry) => {
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        state.pending.push(entry.path());
                    } else if file_type.is_file() {
                        let found = FsEntry {
                            dirname: relative_dirname(&state.root, dir),
                            filename: entry.file_name().to_string_lossy().into_owned(),
                        };
                        return Ok(Some((found, state)));
                    }
                    continue;
                }
                None => state.current = None,
            }
        }
        let Some(next) = state.pending.pop() else {
            return Ok(None);
        };
        let entries = tokio::fs::read_dir(&next).await?;
        state.current = Some((next, entries));
    }
}

#[async_trait]
impl FsAdapter for LocalFsAdapter {
    async fn get_file_size(&self, path: &Path) -> std::io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn read_block(&self, path: &Path, start: u64, end: u64) -> std::io::Result<Bytes> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; end.saturating_sub(start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn append_block(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        file.flush().await
    }

    fn list_files(&self, root: &Path) -> BoxStream<'static, std::io::Result<FsEntry>> {
        let state = ListState {
            root: root.to_path_buf(),
            pending: vec![root.to_path_buf()],
            current: None,
        };
        stream::try_unfold(state, next_file).boxed()
    }
}
