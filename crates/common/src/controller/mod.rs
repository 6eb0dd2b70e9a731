//! The anchoring state machine
//!
//! A [`BrickMapController`] owns one alias. It keeps three views of the
//! archive's tree:
//!
//! - **valid**: the tree as last anchored
//! - **dirty**: valid plus every write not yet anchored, what readers see
//! - **pending**: the diffs swept into the current anchoring round
//!
//! Writes are validated, applied to the dirty tree and recorded in the open
//! diff, then the strategy decides whether to anchor. An anchoring round
//! compacts the pending diffs into one brick, stores it and moves the alias
//! with a compare-and-swap. Losing the race reloads the remote tree and
//! rebases the local diffs onto it before trying again.
//!
//! At most one round runs at a time; triggers arriving meanwhile are
//! folded into the running round rather than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

use crate::anchoring::strategy::{Compacted, Reconciliation};
use crate::anchoring::{
    AliasError, AnchorDecision, AnchoringStrategy, StrategyContext, StrategyError,
};
use crate::brick::HashLink;
use crate::brick_map::{
    path, BrickMap, BrickMapDiff, BrickMapError, ConflictMap, NodeKind, NodeMetadata, PathTree,
};
use crate::storage::StorageError;

mod mutator;
mod state;
mod validator;

pub use mutator::TreeMutator;
pub use state::{AnchorReceipt, AnchoringOutcome, ControllerStatus};
pub use validator::{ReadOnlyPrefixes, WriteOp, WriteValidator};

use state::ControllerState;

/// Failures of an anchoring round
///
/// None of them drop pending writes; the next round retries them.
#[derive(Debug, thiserror::Error)]
pub enum AnchoringError {
    #[error("failed to persist brick: {0}")]
    PersistBrick(StorageError),
    #[error("failed to anchor after {attempts} attempt(s): {source}")]
    AnchorVersion {
        #[source]
        source: AliasError,
        attempts: u32,
    },
    /// Folding an anchored change into the valid tree failed
    #[error("failed to update brick map: {0}")]
    BrickMapUpdate(StrategyError),
    #[error("failed to load remote brick map: {0}")]
    BrickMapLoad(StrategyError),
    #[error("failed to reconcile {} conflicting path(s): {reason}", conflicts.len())]
    BrickMapReconcile {
        conflicts: ConflictMap,
        reason: String,
    },
    #[error("invalid data for {id}: {reason}")]
    InvalidData { id: String, reason: String },
}

impl AnchoringError {
    /// The alias moved on and reconciliation could not keep up
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, AnchoringError::AnchorVersion { source, .. } if source.is_version_conflict())
    }
}

impl From<StorageError> for AnchoringError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidData { id, reason } => AnchoringError::InvalidData { id, reason },
            other => AnchoringError::PersistBrick(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("controller is not initialized; call init or load first")]
    Uninitialized,
    #[error("{op} rejected for {path}: {reason}")]
    ValidationRejected {
        op: WriteOp,
        path: String,
        reason: String,
    },
    #[error("brick map error: {0}")]
    BrickMap(#[from] BrickMapError),
    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),
    #[error("anchoring error: {0}")]
    Anchoring(#[from] Arc<AnchoringError>),
}

struct Inner {
    alias: String,
    ctx: StrategyContext,
    strategy: AnchoringStrategy,
    validator: Option<Arc<dyn WriteValidator>>,
    state: Mutex<ControllerState>,
    anchoring: AtomicBool,
    debounce_scheduled: AtomicBool,
    listeners: SyncMutex<Vec<flume::Sender<AnchoringOutcome>>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrickMapController")
            .field("alias", &self.alias)
            .field("strategy", &self.strategy)
            .field("anchoring", &self.anchoring)
            .finish()
    }
}

/// Drives writes and anchoring for one alias
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct BrickMapController(Arc<Inner>);

pub struct ControllerBuilder {
    alias: String,
    ctx: StrategyContext,
    strategy: AnchoringStrategy,
    validator: Option<Arc<dyn WriteValidator>>,
}

impl ControllerBuilder {
    pub fn validator(mut self, validator: impl WriteValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn build(self) -> BrickMapController {
        BrickMapController(Arc::new(Inner {
            alias: self.alias,
            ctx: self.ctx,
            strategy: self.strategy,
            validator: self.validator,
            state: Mutex::new(ControllerState::new()),
            anchoring: AtomicBool::new(false),
            debounce_scheduled: AtomicBool::new(false),
            listeners: SyncMutex::new(Vec::new()),
        }))
    }
}

impl BrickMapController {
    pub fn builder(
        alias: impl Into<String>,
        ctx: StrategyContext,
        strategy: AnchoringStrategy,
    ) -> ControllerBuilder {
        ControllerBuilder {
            alias: alias.into(),
            ctx,
            strategy,
            validator: None,
        }
    }

    pub fn new(
        alias: impl Into<String>,
        ctx: StrategyContext,
        strategy: AnchoringStrategy,
    ) -> Self {
        Self::builder(alias, ctx, strategy).build()
    }

    pub fn alias(&self) -> &str {
        &self.0.alias
    }

    pub fn context(&self) -> &StrategyContext {
        &self.0.ctx
    }

    /* Lifecycle */

    /// Start from an empty tree, ignoring whatever the alias holds
    pub async fn init(&self) {
        let valid = BrickMap::with_config(self.0.ctx.config().clone());
        self.0.state.lock().await.reset(valid, Vec::new());
        tracing::debug!("BrickMapController::init: {} starts empty", self.0.alias);
    }

    /// Start from the tree currently anchored under the alias
    pub async fn load(&self) -> Result<(), ControllerError> {
        let loaded = self.0.strategy.load(&self.0.ctx, &self.0.alias).await?;
        tracing::debug!(
            "BrickMapController::load: {} at {:?}",
            self.0.alias,
            loaded.last_hash()
        );
        self.0
            .state
            .lock()
            .await
            .reset(loaded.tree, loaded.versions);
        Ok(())
    }

    /// Receive the outcome of every anchoring round from now on
    ///
    /// While at least one receiver is alive, writes return as soon as they
    /// are applied and anchoring continues in the background.
    pub fn subscribe(&self) -> flume::Receiver<AnchoringOutcome> {
        let (tx, rx) = flume::unbounded();
        self.0.listeners.lock().push(tx);
        rx
    }

    fn has_listeners(&self) -> bool {
        let mut listeners = self.0.listeners.lock();
        listeners.retain(|tx| !tx.is_disconnected());
        !listeners.is_empty()
    }

    fn notify(&self, outcome: AnchoringOutcome) {
        self.0
            .listeners
            .lock()
            .retain(|tx| tx.send(outcome.clone()).is_ok());
    }

    pub async fn status(&self) -> ControllerStatus {
        let state = self.0.state.lock().await;
        if !state.initialized {
            ControllerStatus::Uninitialized
        } else if self.0.anchoring.load(Ordering::Acquire) {
            ControllerStatus::Anchoring
        } else if state.has_unanchored() {
            ControllerStatus::Dirty
        } else {
            ControllerStatus::Initialized
        }
    }

    /* Reads, all against the dirty tree */

    /// A copy of the tree including unanchored writes
    pub async fn tree(&self) -> BrickMap {
        self.0.state.lock().await.dirty.clone()
    }

    /// A copy of the tree as last anchored
    pub async fn anchored_tree(&self) -> BrickMap {
        self.0.state.lock().await.valid.clone()
    }

    pub async fn last_anchored_hash(&self) -> Option<String> {
        self.0.state.lock().await.last_valid_hash.clone()
    }

    pub async fn versions(&self) -> Vec<String> {
        self.0.state.lock().await.versions.clone()
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.0.state.lock().await.dirty.exists(path)
    }

    pub async fn kind(&self, path: &str) -> Option<NodeKind> {
        self.0.state.lock().await.dirty.kind(path)
    }

    pub async fn get_hash_links(&self, path: &str) -> Result<Vec<HashLink>, ControllerError> {
        let state = self.0.state.lock().await;
        let links = state.dirty.get_hash_links(path)?.to_vec();
        Ok(links)
    }

    pub async fn get_metadata(&self, path: &str) -> Result<NodeMetadata, ControllerError> {
        let state = self.0.state.lock().await;
        let metadata = state.dirty.get_metadata(path)?.clone();
        Ok(metadata)
    }

    pub async fn get_file_list(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<String>, ControllerError> {
        let state = self.0.state.lock().await;
        let files: Vec<String> = state.dirty.get_file_list(path, recursive)?.collect();
        Ok(files)
    }

    pub async fn get_folder_list(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<String>, ControllerError> {
        let state = self.0.state.lock().await;
        let folders: Vec<String> = state.dirty.get_folder_list(path, recursive)?.collect();
        Ok(folders)
    }

    /* Writes */

    /// Validate, record into a scratch diff, then apply it to the dirty tree
    /// and the open diff together
    async fn write(
        &self,
        checks: &[(WriteOp, &str)],
        record: impl FnOnce(&mut BrickMapDiff) -> Result<(), BrickMapError>,
    ) -> Result<Option<AnchorReceipt>, ControllerError> {
        {
            let mut guard = self.0.state.lock().await;
            let state = &mut *guard;
            if !state.initialized {
                return Err(ControllerError::Uninitialized);
            }

            if let Some(validator) = &self.0.validator {
                for (op, target) in checks {
                    validator.validate(*op, target, &state.dirty).map_err(|e| {
                        ControllerError::ValidationRejected {
                            op: *op,
                            path: path::normalize(target),
                            reason: e.to_string(),
                        }
                    })?;
                }
            }

            let mut scratch = BrickMapDiff::default();
            record(&mut scratch)?;
            // the dirty tree replays atomically; on error nothing was touched
            state.dirty.apply_diff(&scratch)?;
            state.open_diff().apply_diff(&scratch)?;
        }
        self.attempt_anchoring().await
    }

    /* Anchoring */

    /// Ask the strategy whether to anchor now, later or not at all
    ///
    /// Anchors inline unless someone subscribed, in which case the round
    /// runs in the background and reports to the subscribers.
    pub async fn attempt_anchoring(&self) -> Result<Option<AnchorReceipt>, ControllerError> {
        let decision = {
            let state = self.0.state.lock().await;
            self.0.strategy.should_anchor(&state.dirty)
        };

        match decision {
            AnchorDecision::Skip => Ok(None),
            AnchorDecision::Later(delay) => {
                if !self.0.debounce_scheduled.swap(true, Ordering::AcqRel) {
                    let this = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        this.0.debounce_scheduled.store(false, Ordering::Release);
                        this.anchor_in_background().await;
                    });
                }
                Ok(None)
            }
            AnchorDecision::Now if self.has_listeners() => {
                let this = self.clone();
                tokio::spawn(async move { this.anchor_in_background().await });
                Ok(None)
            }
            AnchorDecision::Now => Ok(self.anchor_changes().await?),
        }
    }

    async fn anchor_in_background(&self) {
        if let Err(e) = self.anchor_changes().await {
            tracing::error!(
                "BrickMapController::anchor_in_background: {} failed: {}",
                self.0.alias,
                e
            );
        }
    }

    /// Anchor everything written so far
    ///
    /// Returns `None` when there was nothing to anchor or another round was
    /// already running; that round picks up these writes before it ends.
    pub async fn anchor_changes(&self) -> Result<Option<AnchorReceipt>, Arc<AnchoringError>> {
        if self.0.anchoring.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                "BrickMapController::anchor_changes: {} already anchoring, coalescing",
                self.0.alias
            );
            return Ok(None);
        }

        let mut last = None;
        loop {
            match self.anchor_round().await {
                Ok(receipt) => {
                    if let Some(receipt) = &receipt {
                        self.notify(Ok(receipt.clone()));
                    }
                    last = receipt.or(last);
                }
                Err(e) => {
                    self.0.anchoring.store(false, Ordering::Release);
                    tracing::warn!(
                        "BrickMapController::anchor_changes: round for {} failed: {}",
                        self.0.alias,
                        e
                    );
                    let e = Arc::new(e);
                    self.notify(Err(e.clone()));
                    return Err(e);
                }
            }

            // writes made during the round were not swept into it
            self.0.anchoring.store(false, Ordering::Release);
            let more = self.0.state.lock().await.has_new_items();
            if !more || self.0.anchoring.swap(true, Ordering::AcqRel) {
                return Ok(last);
            }
        }
    }

    /// One round: sweep, compact, persist, compare-and-swap, retrying
    /// through reconciliation on lost races
    async fn anchor_round(&self) -> Result<Option<AnchorReceipt>, AnchoringError> {
        let config = self.0.ctx.config().clone();
        let mut attempts: u32 = 0;
        let mut reconciled = false;

        loop {
            attempts += 1;

            // Sweep new diffs and compact everything pending into one unit
            let (compacted, expected) = {
                let mut guard = self.0.state.lock().await;
                let state = &mut *guard;
                state.sweep();
                if state.pending.is_empty() {
                    return Ok(None);
                }
                let compacted = self
                    .0
                    .strategy
                    .compact_diffs(
                        &state.valid,
                        &state.pending,
                        state.last_valid_hash.as_deref(),
                    )
                    .map_err(AnchoringError::BrickMapUpdate)?;
                (compacted, state.last_valid_hash.clone())
            };

            // Persist it; pending stays put whatever happens
            let mut brick = compacted
                .to_brick(&config)
                .map_err(|e| AnchoringError::BrickMapUpdate(e.into()))?;
            let hash = self.0.ctx.storage.put_brick(&mut brick).await?;

            // Move the alias, expecting the head we built on
            let cas = self
                .0
                .ctx
                .aliases
                .update_alias(&self.0.alias, &hash, expected.as_deref())
                .await;
            match cas {
                Ok(()) => {
                    let mut guard = self.0.state.lock().await;
                    self.fold_in(&mut guard, compacted, &hash)?;
                    drop(guard);
                    tracing::info!(
                        "BrickMapController::anchor_round: {} anchored {} after {} attempt(s)",
                        self.0.alias,
                        hash,
                        attempts
                    );
                    return Ok(Some(AnchorReceipt {
                        hash,
                        attempts,
                        reconciled,
                    }));
                }
                Err(e) if e.is_version_conflict() && attempts < config.max_anchoring_attempts => {
                    tracing::debug!(
                        "BrickMapController::anchor_round: lost race on {} ({}), reconciling",
                        self.0.alias,
                        e
                    );
                    self.handle_anchoring_conflict().await?;
                    reconciled = true;
                }
                Err(source) => return Err(AnchoringError::AnchorVersion { source, attempts }),
            }
        }
    }

    /// Record a successful compare-and-swap
    ///
    /// The hash is the alias head from here on even if folding fails, and
    /// pending diffs are only dropped once they are part of the valid tree.
    fn fold_in(
        &self,
        state: &mut ControllerState,
        compacted: Compacted,
        hash: &str,
    ) -> Result<(), AnchoringError> {
        state.versions.push(hash.to_string());
        state.last_valid_hash = Some(hash.to_string());
        self.0
            .strategy
            .after_anchoring(&mut state.valid, compacted, &state.versions)
            .map_err(AnchoringError::BrickMapUpdate)?;
        state.pending.clear();
        Ok(())
    }

    /// Reload the remote tree and rebase every local diff onto it
    async fn handle_anchoring_conflict(&self) -> Result<(), AnchoringError> {
        let remote = self
            .0
            .strategy
            .load(&self.0.ctx, &self.0.alias)
            .await
            .map_err(AnchoringError::BrickMapLoad)?;

        let mut guard = self.0.state.lock().await;
        let state = &mut *guard;
        // writes made since the round began are rebased too
        state.sweep();

        let reconciled = self
            .0
            .strategy
            .reconcile(Reconciliation {
                remote: &remote.tree,
                last_valid: &state.valid,
                local: &state.pending,
            })
            .map_err(|e| match e {
                StrategyError::Conflict { conflicts, reason } => {
                    AnchoringError::BrickMapReconcile { conflicts, reason }
                }
                StrategyError::Resolver(reason) => AnchoringError::BrickMapReconcile {
                    conflicts: ConflictMap::new(),
                    reason,
                },
                other => AnchoringError::BrickMapUpdate(other),
            })?;

        tracing::info!(
            "BrickMapController::handle_anchoring_conflict: {} rebased {} diff(s) onto {:?}",
            self.0.alias,
            reconciled.diffs.len(),
            remote.last_hash()
        );
        state.last_valid_hash = remote.last_hash().map(str::to_string);
        state.versions = remote.versions;
        state.valid = remote.tree;
        state.dirty = reconciled.tree;
        state.pending = reconciled
            .diffs
            .into_iter()
            .filter(BrickMapDiff::has_items)
            .collect();
        Ok(())
    }
}

#[async_trait]
impl TreeMutator for BrickMapController {
    async fn add_file(
        &self,
        path: &str,
        hash_links: Vec<HashLink>,
    ) -> Result<Option<AnchorReceipt>, ControllerError> {
        self.write(&[(WriteOp::AddFile, path)], |diff| {
            diff.add_file_entry(path, hash_links)
        })
        .await
    }

    async fn append_to_file(
        &self,
        path: &str,
        hash_links: Vec<HashLink>,
    ) -> Result<Option<AnchorReceipt>, ControllerError> {
        self.write(&[(WriteOp::AppendToFile, path)], |diff| {
            diff.append_bricks_to_file(path, hash_links)
        })
        .await
    }

    async fn add_files(
        &self,
        files: Vec<(String, Vec<HashLink>)>,
    ) -> Result<Option<AnchorReceipt>, ControllerError> {
        let checks: Vec<(WriteOp, &str)> = files
            .iter()
            .map(|(path, _)| (WriteOp::AddFile, path.as_str()))
            .collect();
        self.write(&checks, |diff| {
            for (path, links) in &files {
                diff.add_file_entry(path, links.clone())?;
            }
            Ok(())
        })
        .await
    }

    async fn delete_file(&self, path: &str) -> Result<Option<AnchorReceipt>, ControllerError> {
        self.write(&[(WriteOp::DeleteFile, path)], |diff| diff.delete(path))
            .await
    }

    async fn create_directory(
        &self,
        path: &str,
    ) -> Result<Option<AnchorReceipt>, ControllerError> {
        self.write(&[(WriteOp::CreateDirectory, path)], |diff| {
            diff.create_folder(path)
        })
        .await
    }

    async fn create_file(&self, path: &str) -> Result<Option<AnchorReceipt>, ControllerError> {
        self.write(&[(WriteOp::CreateFile, path)], |diff| diff.create_file(path))
            .await
    }

    async fn copy_file(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<AnchorReceipt>, ControllerError> {
        self.write(&[(WriteOp::CopyFile, dst)], |diff| diff.copy(src, dst))
            .await
    }

    async fn rename_file(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<AnchorReceipt>, ControllerError> {
        if path::normalize(src) == path::normalize(dst) {
            return Ok(None);
        }
        if path::is_within(dst, src) {
            return Err(BrickMapError::InvalidOperation(format!(
                "cannot move {} into itself at {}",
                src, dst
            ))
            .into());
        }
        self.write(
            &[(WriteOp::RenameFile, src), (WriteOp::RenameFile, dst)],
            |diff| {
                diff.copy(src, dst)?;
                diff.delete(src)
            },
        )
        .await
    }
}
