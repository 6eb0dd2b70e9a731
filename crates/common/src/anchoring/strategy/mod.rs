//! Anchoring strategies
//!
//! A strategy decides how an archive's history is laid out behind its alias
//! and how local changes are folded into it:
//!
//! - **[`DiffStrategy`]**: every anchored version is a diff brick; loading
//!   replays the whole chain onto an empty tree.
//! - **[`LatestVersionStrategy`]**: every anchored version is a full
//!   snapshot; loading only fetches the newest one.
//!
//! Both share [`StrategyOptions`]: an anchoring decision function, a debounce
//! delay, a conflict resolver and a cache of loaded trees keyed by the joined
//! hash list of the history they were built from.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

use crate::brick::Brick;
use crate::brick_map::{
    decode_params, BrickMap, BrickMapDiff, BrickMapError, ConflictMap, PathTree,
};
use crate::config::ArchiveConfig;
use crate::storage::{BrickStorageService, StorageError};

use super::alias::{AliasError, AliasStore};

mod diff;
mod latest_version;
mod resolver;
mod validator;

pub use diff::DiffStrategy;
pub use latest_version::LatestVersionStrategy;
pub use resolver::{ConflictFile, ConflictResolver, LocalWins, RemoteWins};
pub use validator::{AcceptAll, ChainValidator, HistoryValidator};

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("strategy error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("alias error: {0}")]
    Alias(#[from] AliasError),
    #[error("brick map error: {0}")]
    BrickMap(#[from] BrickMapError),
    #[error("history rejected at {hash}: {reason}")]
    Validation { hash: String, reason: String },
    /// Local changes collide with the remote tree and nothing resolved them
    #[error("{} conflicting path(s): {reason}", conflicts.len())]
    Conflict {
        conflicts: ConflictMap,
        reason: String,
    },
    #[error("conflict resolver failed: {0}")]
    Resolver(String),
}

/// Should a write be anchored right away
pub type AnchorDecisionFn = Arc<dyn Fn(&BrickMap) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorDecision {
    Now,
    /// Anchor once the delay elapses, folding in writes made meanwhile
    Later(Duration),
    Skip,
}

#[derive(Clone, Default)]
pub struct StrategyOptions {
    pub decision: Option<AnchorDecisionFn>,
    pub anchoring_delay: Option<Duration>,
    pub conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    pub validator: Option<Arc<dyn HistoryValidator>>,
    /// Number of loaded trees to keep; `None` disables caching
    pub cache_capacity: Option<usize>,
}

impl fmt::Debug for StrategyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyOptions")
            .field("decision", &self.decision.is_some())
            .field("anchoring_delay", &self.anchoring_delay)
            .field("conflict_resolver", &self.conflict_resolver)
            .field("validator", &self.validator)
            .field("cache_capacity", &self.cache_capacity)
            .finish()
    }
}

impl StrategyOptions {
    pub fn with_decision(
        mut self,
        decision: impl Fn(&BrickMap) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.decision = Some(Arc::new(decision));
        self
    }

    pub fn with_anchoring_delay(mut self, delay: Duration) -> Self {
        self.anchoring_delay = Some(delay);
        self
    }

    pub fn with_conflict_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.conflict_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_validator(mut self, validator: impl HistoryValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }
}

/// Loaded trees keyed by the joined hash list they were built from
#[derive(Debug)]
pub(crate) struct HistoryCache(Option<Mutex<LruCache<String, BrickMap>>>);

impl HistoryCache {
    pub fn new(capacity: Option<usize>) -> Self {
        Self(capacity.and_then(NonZeroUsize::new).map(|c| Mutex::new(LruCache::new(c))))
    }

    pub fn key(versions: &[String]) -> String {
        versions.join(",")
    }

    pub fn get(&self, versions: &[String]) -> Option<BrickMap> {
        let cache = self.0.as_ref()?;
        cache.lock().get(&Self::key(versions)).cloned()
    }

    pub fn put(&self, versions: &[String], tree: &BrickMap) {
        if let Some(cache) = &self.0 {
            cache.lock().put(Self::key(versions), tree.clone());
        }
    }
}

/// Collaborators a strategy reads history through
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub storage: BrickStorageService,
    pub aliases: Arc<dyn AliasStore>,
}

impl StrategyContext {
    pub fn new(storage: BrickStorageService, aliases: Arc<dyn AliasStore>) -> Self {
        Self { storage, aliases }
    }

    pub fn config(&self) -> &Arc<ArchiveConfig> {
        self.storage.config()
    }

    /// Fetch and verify a serialized tree or diff
    pub(crate) async fn fetch_tree_brick(&self, hash: &str) -> Result<Brick, StrategyError> {
        let params = decode_params(self.config().map_encryption_key.as_ref());
        Ok(self.storage.get_brick(hash, params).await?)
    }
}

/// The anchored state of an alias
#[derive(Debug, Clone)]
pub struct LoadedHistory {
    pub tree: BrickMap,
    /// Every anchored hash, oldest first
    pub versions: Vec<String>,
}

impl LoadedHistory {
    pub fn last_hash(&self) -> Option<&str> {
        self.versions.last().map(String::as_str)
    }
}

/// Pending changes folded into the single brick that gets anchored
#[derive(Debug, Clone)]
pub enum Compacted {
    Diff(BrickMapDiff),
    Snapshot(BrickMap),
}

impl Compacted {
    pub fn to_brick(&self, config: &ArchiveConfig) -> Result<Brick, BrickMapError> {
        match self {
            Compacted::Diff(diff) => diff.to_brick(config),
            Compacted::Snapshot(tree) => tree.to_brick_with(config),
        }
    }
}

/// Inputs to reconciliation after a lost compare-and-swap
#[derive(Debug)]
pub struct Reconciliation<'a> {
    /// The tree as currently anchored remotely
    pub remote: &'a BrickMap,
    /// The last tree this controller anchored or loaded
    pub last_valid: &'a BrickMap,
    /// Local diffs not yet anchored, pending first then new
    pub local: &'a [BrickMapDiff],
}

/// The outcome of reconciliation
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// `remote` with `diffs` replayed onto it
    pub tree: BrickMap,
    /// The local diffs to anchor next, possibly rewritten by a resolver
    pub diffs: Vec<BrickMapDiff>,
}

/// Replay `diffs` onto a clone of `base`
pub(crate) fn replay_onto(
    base: &BrickMap,
    diffs: &[BrickMapDiff],
) -> Result<BrickMap, BrickMapError> {
    let mut tree = base.clone();
    for diff in diffs {
        tree.apply_diff(diff)?;
    }
    Ok(tree)
}

/// Hand conflicts to the resolver, or fail with them
pub(crate) fn resolve_conflicts(
    resolver: Option<&Arc<dyn ConflictResolver>>,
    input: &Reconciliation<'_>,
    conflicts: ConflictMap,
    reason: String,
) -> Result<Reconciled, StrategyError> {
    let Some(resolver) = resolver else {
        return Err(StrategyError::Conflict { conflicts, reason });
    };
    tracing::warn!(
        "resolve_conflicts: handing {} conflict(s) to {:?}",
        conflicts.len(),
        resolver
    );
    let diffs = resolver
        .resolve(input.remote, input.local, &conflicts)
        .map_err(|e| StrategyError::Resolver(e.to_string()))?;
    let tree = replay_onto(input.remote, &diffs)
        .map_err(|e| StrategyError::Resolver(format!("resolved diffs do not apply: {}", e)))?;
    Ok(Reconciled { tree, diffs })
}

/// The anchoring policy of a controller
#[derive(Debug)]
pub enum AnchoringStrategy {
    Diff(DiffStrategy),
    LatestVersion(LatestVersionStrategy),
}

impl AnchoringStrategy {
    pub fn diff(options: StrategyOptions) -> Self {
        AnchoringStrategy::Diff(DiffStrategy::new(options))
    }

    pub fn latest_version(options: StrategyOptions) -> Self {
        AnchoringStrategy::LatestVersion(LatestVersionStrategy::new(options))
    }

    pub fn options(&self) -> &StrategyOptions {
        match self {
            AnchoringStrategy::Diff(s) => s.options(),
            AnchoringStrategy::LatestVersion(s) => s.options(),
        }
    }

    /// Assemble the anchored tree for `alias`
    pub async fn load(
        &self,
        ctx: &StrategyContext,
        alias: &str,
    ) -> Result<LoadedHistory, StrategyError> {
        match self {
            AnchoringStrategy::Diff(s) => s.load(ctx, alias).await,
            AnchoringStrategy::LatestVersion(s) => s.load(ctx, alias).await,
        }
    }

    /// Fold `diffs` into one anchorable unit on top of `valid`
    ///
    /// `prev` is the hash the result will be anchored on top of.
    pub fn compact_diffs(
        &self,
        valid: &BrickMap,
        diffs: &[BrickMapDiff],
        prev: Option<&str>,
    ) -> Result<Compacted, StrategyError> {
        match self {
            AnchoringStrategy::Diff(s) => s.compact_diffs(diffs, prev),
            AnchoringStrategy::LatestVersion(s) => s.compact_diffs(valid, diffs),
        }
    }

    /// Fold an anchored unit into `valid`; `versions` includes its hash
    pub fn after_anchoring(
        &self,
        valid: &mut BrickMap,
        compacted: Compacted,
        versions: &[String],
    ) -> Result<(), StrategyError> {
        match self {
            AnchoringStrategy::Diff(s) => s.after_anchoring(valid, compacted, versions),
            AnchoringStrategy::LatestVersion(s) => s.after_anchoring(valid, compacted, versions),
        }
    }

    /// Rebase local diffs onto a newer remote tree
    pub fn reconcile(&self, input: Reconciliation<'_>) -> Result<Reconciled, StrategyError> {
        match self {
            AnchoringStrategy::Diff(s) => s.reconcile(input),
            AnchoringStrategy::LatestVersion(s) => s.reconcile(input),
        }
    }

    pub fn should_anchor(&self, dirty: &BrickMap) -> AnchorDecision {
        let options = self.options();
        if let Some(decision) = &options.decision {
            if !decision(dirty) {
                return AnchorDecision::Skip;
            }
        }
        match options.anchoring_delay {
            Some(delay) => AnchorDecision::Later(delay),
            None => AnchorDecision::Now,
        }
    }
}
