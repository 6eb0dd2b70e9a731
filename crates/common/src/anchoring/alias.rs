use async_trait::async_trait;

#[derive(thiserror::Error, Debug)]
pub enum AliasError {
    #[error("unhandled alias store error: {0}")]
    Default(#[from] anyhow::Error),
    /// The expected head no longer matches the store's current head
    #[error("version conflict on {alias}: expected {expected:?}, found {current:?}")]
    VersionConflict {
        alias: String,
        expected: Option<String>,
        current: Option<String>,
    },
}

impl AliasError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, AliasError::VersionConflict { .. })
    }
}

/// External versioned pointer from an alias to its history of hashes
#[async_trait]
pub trait AliasStore: Send + Sync + std::fmt::Debug {
    /// Every anchored hash for `alias`, oldest first
    async fn get_all_versions(&self, alias: &str) -> Result<Vec<String>, AliasError>;

    /// Compare-and-swap append
    ///
    /// Must fail with [`AliasError::VersionConflict`] when `expected` is not
    /// the current head (`None` meaning the alias has no versions yet).
    async fn update_alias(
        &self,
        alias: &str,
        new_hash: &str,
        expected: Option<&str>,
    ) -> Result<(), AliasError>;

    async fn latest_version(&self, alias: &str) -> Result<Option<String>, AliasError> {
        Ok(self.get_all_versions(alias).await?.pop())
    }
}
