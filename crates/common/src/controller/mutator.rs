use async_trait::async_trait;

use crate::brick::HashLink;

use super::{AnchorReceipt, ControllerError};

/// The write surface of a controller
///
/// Every write is validated, applied to the dirty tree and recorded in the
/// open diff before anchoring is attempted. A write that fails leaves both
/// untouched. When the write anchored inline, the receipt of that round is
/// returned.
#[async_trait]
pub trait TreeMutator: Send + Sync {
    /// Replace a file's content, creating it if needed
    async fn add_file(
        &self,
        path: &str,
        hash_links: Vec<HashLink>,
    ) -> Result<Option<AnchorReceipt>, ControllerError>;

    async fn append_to_file(
        &self,
        path: &str,
        hash_links: Vec<HashLink>,
    ) -> Result<Option<AnchorReceipt>, ControllerError>;

    /// Add several files as a single write; either all land or none do
    async fn add_files(
        &self,
        files: Vec<(String, Vec<HashLink>)>,
    ) -> Result<Option<AnchorReceipt>, ControllerError>;

    async fn delete_file(&self, path: &str) -> Result<Option<AnchorReceipt>, ControllerError>;

    /// Create a directory and any missing parents
    async fn create_directory(&self, path: &str)
        -> Result<Option<AnchorReceipt>, ControllerError>;

    /// Create an empty file, or leave an existing one alone
    async fn create_file(&self, path: &str) -> Result<Option<AnchorReceipt>, ControllerError>;

    async fn copy_file(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<AnchorReceipt>, ControllerError>;

    /// Move a file or folder: a copy followed by a delete of the source
    async fn rename_file(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<AnchorReceipt>, ControllerError>;
}
