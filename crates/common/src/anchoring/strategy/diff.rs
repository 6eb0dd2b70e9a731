use crate::brick_map::{BrickMap, BrickMapDiff, PathTree};

use super::{
    replay_onto, resolve_conflicts, Compacted, HistoryCache, LoadedHistory, Reconciled,
    Reconciliation, StrategyContext, StrategyError, StrategyOptions,
};

/// History as a chain of diffs, replayed in order onto an empty tree
#[derive(Debug)]
pub struct DiffStrategy {
    options: StrategyOptions,
    cache: HistoryCache,
}

impl DiffStrategy {
    pub fn new(options: StrategyOptions) -> Self {
        let cache = HistoryCache::new(options.cache_capacity);
        Self { options, cache }
    }

    pub fn options(&self) -> &StrategyOptions {
        &self.options
    }

    /// The longest prefix of `versions` with a cached tree
    fn cached_prefix(&self, versions: &[String]) -> Option<(usize, BrickMap)> {
        (1..=versions.len())
            .rev()
            .find_map(|n| self.cache.get(&versions[..n]).map(|tree| (n, tree)))
    }

    pub async fn load(
        &self,
        ctx: &StrategyContext,
        alias: &str,
    ) -> Result<LoadedHistory, StrategyError> {
        let versions = ctx.aliases.get_all_versions(alias).await?;
        let (start, mut tree) = match self.cached_prefix(&versions) {
            Some(hit) => hit,
            None => (0, BrickMap::with_config(ctx.config().clone())),
        };
        tracing::debug!(
            "DiffStrategy::load: {} has {} version(s), replaying {}",
            alias,
            versions.len(),
            versions.len() - start
        );

        let mut previous = start.checked_sub(1).map(|i| versions[i].as_str());
        for hash in &versions[start..] {
            let mut brick = ctx.fetch_tree_brick(hash).await?;
            let diff = BrickMapDiff::from_brick(&mut brick)?;
            if let Some(validator) = &self.options.validator {
                validator
                    .validate_diff(previous, hash, &diff)
                    .map_err(|e| StrategyError::Validation {
                        hash: hash.clone(),
                        reason: e.to_string(),
                    })?;
            }
            tree.apply_diff(&diff)?;
            previous = Some(hash.as_str());
        }

        tree.attach_config(ctx.config().clone());
        if !versions.is_empty() {
            self.cache.put(&versions, &tree);
        }
        Ok(LoadedHistory { tree, versions })
    }

    /// Fold every diff into one, chained onto `prev`
    pub fn compact_diffs(
        &self,
        diffs: &[BrickMapDiff],
        prev: Option<&str>,
    ) -> Result<Compacted, StrategyError> {
        let mut compacted = match diffs.split_first() {
            Some((first, rest)) => {
                let mut compacted = first.clone();
                for diff in rest {
                    compacted.apply_diff(diff)?;
                }
                compacted
            }
            None => BrickMapDiff::default(),
        };
        compacted.set_prev(prev.map(str::to_string));
        Ok(Compacted::Diff(compacted))
    }

    pub fn after_anchoring(
        &self,
        valid: &mut BrickMap,
        compacted: Compacted,
        versions: &[String],
    ) -> Result<(), StrategyError> {
        match compacted {
            Compacted::Diff(diff) => valid.apply_diff(&diff)?,
            Compacted::Snapshot(tree) => *valid = tree,
        }
        self.cache.put(versions, valid);
        Ok(())
    }

    /// Replay local diffs onto the remote tree
    ///
    /// Only a structural failure of the replay counts as a conflict; a plain
    /// version race rebases cleanly.
    pub fn reconcile(&self, input: Reconciliation<'_>) -> Result<Reconciled, StrategyError> {
        match replay_onto(input.remote, input.local) {
            Ok(tree) => Ok(Reconciled {
                tree,
                diffs: input.local.to_vec(),
            }),
            Err(e) => {
                tracing::warn!("DiffStrategy::reconcile: local diffs do not replay: {}", e);
                let conflicts = input
                    .remote
                    .detect_merge_conflicts(input.local)
                    .unwrap_or_default();
                resolve_conflicts(
                    self.options.conflict_resolver.as_ref(),
                    &input,
                    conflicts,
                    e.to_string(),
                )
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::anchoring::{AliasStore, MemoryAliasStore};
    use crate::anchoring::strategy::{ChainValidator, RemoteWins};
    use crate::brick::HashLink;
    use crate::config::ArchiveConfig;
    use crate::storage::{BrickStorageService, LocalFsAdapter, MemoryBrickStore};

    fn link(hash: &str) -> HashLink {
        HashLink::new(hash, format!("sum-{}", hash), None)
    }

    fn context_with(store: MemoryBrickStore) -> StrategyContext {
        let storage = BrickStorageService::new(
            Arc::new(store),
            Arc::new(LocalFsAdapter),
            Arc::new(ArchiveConfig::default()),
        );
        StrategyContext::new(storage, Arc::new(MemoryAliasStore::new()))
    }

    fn context() -> StrategyContext {
        context_with(MemoryBrickStore::new())
    }

    async fn anchor(ctx: &StrategyContext, diff: &BrickMapDiff, expected: Option<&str>) -> String {
        let mut brick = diff.to_brick(ctx.config()).unwrap();
        let hash = ctx.storage.put_brick(&mut brick).await.unwrap();
        ctx.aliases.update_alias("a", &hash, expected).await.unwrap();
        hash
    }

    #[tokio::test]
    async fn test_load_replays_chain() {
        let ctx = context();
        let strategy = DiffStrategy::new(StrategyOptions::default().with_validator(ChainValidator));

        let mut first = BrickMapDiff::new(None);
        first.add_file_entry("/a", vec![link("1")]).unwrap();
        let h1 = anchor(&ctx, &first, None).await;
        let mut second = BrickMapDiff::new(Some(h1.clone()));
        second.append_bricks_to_file("/a", vec![link("2")]).unwrap();
        second.create_folder("/dir").unwrap();
        let h2 = anchor(&ctx, &second, Some(&h1)).await;

        let loaded = strategy.load(&ctx, "a").await.unwrap();
        assert_eq!(loaded.versions, vec![h1, h2.clone()]);
        assert_eq!(loaded.last_hash(), Some(h2.as_str()));
        assert_eq!(loaded.tree.get_hash_links("/a").unwrap(), &[link("1"), link("2")]);
        assert!(loaded.tree.exists("/dir"));
    }

    #[tokio::test]
    async fn test_load_rejects_broken_chain() {
        let ctx = context();
        let strategy = DiffStrategy::new(StrategyOptions::default().with_validator(ChainValidator));

        let h1 = anchor(&ctx, &BrickMapDiff::new(None), None).await;
        let mut stray = BrickMapDiff::new(Some("elsewhere".into()));
        stray.create_folder("/x").unwrap();
        anchor(&ctx, &stray, Some(&h1)).await;

        let err = strategy.load(&ctx, "a").await.unwrap_err();
        assert!(matches!(err, StrategyError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_load_uses_cached_prefix() {
        let store = MemoryBrickStore::new();
        let ctx = context_with(store.clone());
        let strategy = DiffStrategy::new(StrategyOptions::default().with_cache(4));

        let mut first = BrickMapDiff::new(None);
        first.create_folder("/one").unwrap();
        let h1 = anchor(&ctx, &first, None).await;
        strategy.load(&ctx, "a").await.unwrap();

        // a second fetch of the first diff would fail verification
        store.corrupt(&h1, bytes::Bytes::from_static(b"garbage"));
        let mut second = BrickMapDiff::new(Some(h1.clone()));
        second.create_folder("/two").unwrap();
        anchor(&ctx, &second, Some(&h1)).await;

        let loaded = strategy.load(&ctx, "a").await.unwrap();
        assert!(loaded.tree.exists("/one"));
        assert!(loaded.tree.exists("/two"));
    }

    #[test]
    fn test_compact_folds_into_first() {
        let strategy = DiffStrategy::new(StrategyOptions::default());
        let mut first = BrickMapDiff::new(Some("stale".into()));
        first.create_folder("/a").unwrap();
        let mut second = BrickMapDiff::default();
        second.create_file("/a/b").unwrap();

        let Compacted::Diff(compacted) = strategy
            .compact_diffs(&[first, second], Some("head"))
            .unwrap()
        else {
            panic!("expected a diff");
        };
        assert_eq!(compacted.log().len(), 2);
        assert_eq!(compacted.prev(), Some("head"));
    }

    #[test]
    fn test_reconcile_rebases_and_reports_conflicts() {
        let strategy = DiffStrategy::new(StrategyOptions::default());
        let mut remote = BrickMap::new();
        remote.add_file_entry("/theirs", vec![link("t")]).unwrap();

        let mut local = BrickMapDiff::default();
        local.add_file_entry("/ours", vec![link("o")]).unwrap();
        let local = vec![local];
        let reconciled = strategy
            .reconcile(Reconciliation {
                remote: &remote,
                last_valid: &BrickMap::new(),
                local: &local,
            })
            .unwrap();
        assert!(reconciled.tree.exists("/theirs"));
        assert!(reconciled.tree.exists("/ours"));

        // a remote file where a local folder should go cannot replay
        let mut clash = BrickMapDiff::default();
        clash.create_folder("/theirs").unwrap();
        let clash = vec![clash];
        let input = Reconciliation {
            remote: &remote,
            last_valid: &BrickMap::new(),
            local: &clash,
        };
        match strategy.reconcile(input) {
            Err(StrategyError::Conflict { conflicts, .. }) => {
                assert!(conflicts.contains_key("/theirs"))
            }
            other => panic!("expected a conflict, got {:?}", other),
        }

        let resolving =
            DiffStrategy::new(StrategyOptions::default().with_conflict_resolver(RemoteWins));
        let reconciled = resolving
            .reconcile(Reconciliation {
                remote: &remote,
                last_valid: &BrickMap::new(),
                local: &clash,
            })
            .unwrap();
        assert!(reconciled.tree.same_structure(&remote));
    }
}
