use crate::brick_map::{BrickMap, BrickMapDiff, ConflictMap, PathTree};

use super::{
    replay_onto, resolve_conflicts, Compacted, HistoryCache, LoadedHistory, Reconciled,
    Reconciliation, StrategyContext, StrategyError, StrategyOptions,
};

/// History addressed by its latest snapshot only
///
/// Every anchored version is a full tree, so loading never replays history.
#[derive(Debug)]
pub struct LatestVersionStrategy {
    options: StrategyOptions,
    cache: HistoryCache,
}

impl LatestVersionStrategy {
    pub fn new(options: StrategyOptions) -> Self {
        let cache = HistoryCache::new(options.cache_capacity);
        Self { options, cache }
    }

    pub fn options(&self) -> &StrategyOptions {
        &self.options
    }

    pub async fn load(
        &self,
        ctx: &StrategyContext,
        alias: &str,
    ) -> Result<LoadedHistory, StrategyError> {
        let versions = ctx.aliases.get_all_versions(alias).await?;
        let Some(hash) = versions.last() else {
            tracing::debug!("LatestVersionStrategy::load: {} has no versions yet", alias);
            return Ok(LoadedHistory {
                tree: BrickMap::with_config(ctx.config().clone()),
                versions,
            });
        };

        if let Some(tree) = self.cache.get(&versions) {
            tracing::debug!("LatestVersionStrategy::load: {} served from cache", hash);
            return Ok(LoadedHistory { tree, versions });
        }

        let mut brick = ctx.fetch_tree_brick(hash).await?;
        let mut tree = BrickMap::with_config(ctx.config().clone());
        tree.load(&mut brick)?;
        if let Some(validator) = &self.options.validator {
            validator
                .validate_snapshot(hash, &tree)
                .map_err(|e| StrategyError::Validation {
                    hash: hash.clone(),
                    reason: e.to_string(),
                })?;
        }
        tracing::debug!(
            "LatestVersionStrategy::load: {} at version {} ({})",
            alias,
            versions.len(),
            hash
        );

        self.cache.put(&versions, &tree);
        Ok(LoadedHistory { tree, versions })
    }

    /// Replay every diff onto a clone of the anchored tree
    pub fn compact_diffs(
        &self,
        valid: &BrickMap,
        diffs: &[BrickMapDiff],
    ) -> Result<Compacted, StrategyError> {
        Ok(Compacted::Snapshot(replay_onto(valid, diffs)?))
    }

    pub fn after_anchoring(
        &self,
        valid: &mut BrickMap,
        compacted: Compacted,
        versions: &[String],
    ) -> Result<(), StrategyError> {
        match compacted {
            Compacted::Snapshot(tree) => *valid = tree,
            Compacted::Diff(diff) => valid.apply_diff(&diff)?,
        }
        self.cache.put(versions, valid);
        Ok(())
    }

    /// Merge the remote change-set with the local one
    ///
    /// Only paths the remote actually changed since `last_valid` can
    /// conflict; local writes to paths the remote left alone are fine.
    pub fn reconcile(&self, input: Reconciliation<'_>) -> Result<Reconciled, StrategyError> {
        let detected = input
            .remote
            .detect_merge_conflicts(input.local)
            .unwrap_or_default();
        let conflicts: ConflictMap = detected
            .iter()
            .filter(|(path, _)| input.last_valid.changed_between(input.remote, path))
            .map(|(path, info)| (path.clone(), info.clone()))
            .collect();

        if !conflicts.is_empty() {
            tracing::warn!(
                "LatestVersionStrategy::reconcile: {} path(s) changed on both sides",
                conflicts.len()
            );
            return resolve_conflicts(
                self.options.conflict_resolver.as_ref(),
                &input,
                conflicts,
                "paths changed both locally and remotely".to_string(),
            );
        }

        let theirs = input.last_valid.diff(input.remote);
        let mut candidate = input.last_valid.clone();
        candidate.merge(&theirs);
        match replay_onto(&candidate, input.local) {
            Ok(tree) => Ok(Reconciled {
                tree,
                diffs: input.local.to_vec(),
            }),
            Err(e) => {
                tracing::warn!(
                    "LatestVersionStrategy::reconcile: local diffs do not replay: {}",
                    e
                );
                resolve_conflicts(
                    self.options.conflict_resolver.as_ref(),
                    &input,
                    detected,
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
    use crate::anchoring::strategy::LocalWins;
    use crate::anchoring::{AliasStore, MemoryAliasStore};
    use crate::brick::HashLink;
    use crate::config::ArchiveConfig;
    use crate::storage::{BrickStorageService, LocalFsAdapter, MemoryBrickStore};

    fn link(hash: &str) -> HashLink {
        HashLink::new(hash, format!("sum-{}", hash), None)
    }

    fn context() -> StrategyContext {
        let storage = BrickStorageService::new(
            Arc::new(MemoryBrickStore::new()),
            Arc::new(LocalFsAdapter),
            Arc::new(ArchiveConfig::default()),
        );
        StrategyContext::new(storage, Arc::new(MemoryAliasStore::new()))
    }

    fn base() -> BrickMap {
        let mut tree = BrickMap::new();
        tree.add_file_entry("/doc.txt", vec![link("v0")]).unwrap();
        tree.create_folder("/shared").unwrap();
        tree
    }

    #[tokio::test]
    async fn test_load_fetches_latest_only() {
        let ctx = context();
        let strategy = LatestVersionStrategy::new(StrategyOptions::default());
        let empty = strategy.load(&ctx, "a").await.unwrap();
        assert!(empty.versions.is_empty());
        assert!(empty.tree.items().is_empty());

        // the first version is never stored, so loading must not touch it
        ctx.aliases.update_alias("a", "missing", None).await.unwrap();
        let mut brick = base().to_brick_with(ctx.config()).unwrap();
        let hash = ctx.storage.put_brick(&mut brick).await.unwrap();
        ctx.aliases
            .update_alias("a", &hash, Some("missing"))
            .await
            .unwrap();

        let loaded = strategy.load(&ctx, "a").await.unwrap();
        assert_eq!(loaded.last_hash(), Some(hash.as_str()));
        assert!(loaded.tree.same_structure(&base()));
    }

    #[test]
    fn test_compact_snapshots_onto_valid() {
        let strategy = LatestVersionStrategy::new(StrategyOptions::default());
        let valid = base();
        let mut diff = BrickMapDiff::default();
        diff.create_file("/shared/new").unwrap();

        let Compacted::Snapshot(tree) = strategy.compact_diffs(&valid, &[diff]).unwrap() else {
            panic!("expected a snapshot");
        };
        assert!(tree.exists("/shared/new"));
        assert!(!valid.exists("/shared/new"));
    }

    #[test]
    fn test_reconcile_merges_disjoint_changes() {
        let strategy = LatestVersionStrategy::new(StrategyOptions::default());
        let last_valid = base();
        let mut remote = base();
        remote.add_file_entry("/shared/theirs", vec![link("t")]).unwrap();

        // overwriting a path the remote left alone is not a conflict
        let mut local = BrickMapDiff::default();
        local.add_file_entry("/doc.txt", vec![link("ours")]).unwrap();
        local.add_file_entry("/shared/ours", vec![link("o")]).unwrap();
        let local = vec![local];

        let reconciled = strategy
            .reconcile(Reconciliation {
                remote: &remote,
                last_valid: &last_valid,
                local: &local,
            })
            .unwrap();
        assert!(reconciled.tree.exists("/shared/theirs"));
        assert!(reconciled.tree.exists("/shared/ours"));
        assert_eq!(
            reconciled.tree.get_hash_links("/doc.txt").unwrap(),
            &[link("ours")]
        );
    }

    #[test]
    fn test_reconcile_detects_true_conflicts() {
        let last_valid = base();
        let mut remote = base();
        remote.add_file_entry("/doc.txt", vec![link("theirs")]).unwrap();

        let mut local = BrickMapDiff::default();
        local.add_file_entry("/doc.txt", vec![link("ours")]).unwrap();
        let local = vec![local];

        let strategy = LatestVersionStrategy::new(StrategyOptions::default());
        let input = Reconciliation {
            remote: &remote,
            last_valid: &last_valid,
            local: &local,
        };
        match strategy.reconcile(input) {
            Err(StrategyError::Conflict { conflicts, .. }) => {
                assert_eq!(conflicts.len(), 1);
                assert!(conflicts.contains_key("/doc.txt"));
            }
            other => panic!("expected a conflict, got {:?}", other),
        }

        let options = StrategyOptions::default().with_conflict_resolver(LocalWins);
        let strategy = LatestVersionStrategy::new(options);
        let reconciled = strategy
            .reconcile(Reconciliation {
                remote: &remote,
                last_valid: &last_valid,
                local: &local,
            })
            .unwrap();
        assert_eq!(
            reconciled.tree.get_hash_links("/doc.txt").unwrap(),
            &[link("ours")]
        );
    }
}
