use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::alias::{AliasError, AliasStore};

/// In-memory alias store with compare-and-swap updates
#[derive(Debug, Clone, Default)]
pub struct MemoryAliasStore {
    inner: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl MemoryAliasStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AliasStore for MemoryAliasStore {
    async fn get_all_versions(&self, alias: &str) -> Result<Vec<String>, AliasError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| anyhow::anyhow!("failed to acquire read lock: {}", e))?;
        Ok(inner.get(alias).cloned().unwrap_or_default())
    }

    async fn update_alias(
        &self,
        alias: &str,
        new_hash: &str,
        expected: Option<&str>,
    ) -> Result<(), AliasError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| anyhow::anyhow!("failed to acquire write lock: {}", e))?;

        let versions = inner.entry(alias.to_string()).or_default();
        let current = versions.last().map(String::as_str);
        if current != expected {
            return Err(AliasError::VersionConflict {
                alias: alias.to_string(),
                expected: expected.map(str::to_string),
                current: current.map(str::to_string),
            });
        }

        versions.push(new_hash.to_string());
        tracing::debug!(
            "MemoryAliasStore::update_alias: {} -> {} (version {})",
            alias,
            new_hash,
            versions.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_cas_append() {
        let store = MemoryAliasStore::new();
        assert!(store.get_all_versions("a").await.unwrap().is_empty());

        store.update_alias("a", "h1", None).await.unwrap();
        store.update_alias("a", "h2", Some("h1")).await.unwrap();
        assert_eq!(
            store.get_all_versions("a").await.unwrap(),
            vec!["h1".to_string(), "h2".to_string()]
        );
        assert_eq!(store.latest_version("a").await.unwrap().as_deref(), Some("h2"));
    }

    #[tokio::test]
    async fn test_stale_expected_conflicts() {
        let store = MemoryAliasStore::new();
        store.update_alias("a", "h1", None).await.unwrap();

        let err = store.update_alias("a", "h2", None).await.unwrap_err();
        assert!(err.is_version_conflict());
        let err = store.update_alias("a", "h2", Some("stale")).await.unwrap_err();
        assert!(matches!(
            err,
            AliasError::VersionConflict { current: Some(ref c), .. } if c == "h1"
        ));
        assert_eq!(store.get_all_versions("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_aliases_are_independent() {
        let store = MemoryAliasStore::new();
        store.update_alias("a", "h1", None).await.unwrap();
        store.update_alias("b", "h1", None).await.unwrap();
        assert_eq!(store.get_all_versions("b").await.unwrap().len(), 1);
    }
}
