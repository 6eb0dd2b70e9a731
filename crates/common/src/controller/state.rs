use std::sync::Arc;

use crate::brick_map::{BrickMap, BrickMapDiff};

use super::AnchoringError;

/// Where a controller is in its anchoring cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// Neither `init` nor `load` has run
    Uninitialized,
    /// Every write is anchored
    Initialized,
    /// Writes are waiting for an anchoring round
    Dirty,
    /// A round is in flight
    Anchoring,
}

/// A successful anchoring round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorReceipt {
    /// The hash now at the head of the alias
    pub hash: String,
    /// Compare-and-swap attempts the round took
    pub attempts: u32,
    /// Whether a lost race forced a reconciliation
    pub reconciled: bool,
}

/// What a subscribed listener receives after every round
pub type AnchoringOutcome = Result<AnchorReceipt, Arc<AnchoringError>>;

/// The three trees a controller juggles
///
/// `dirty` is always `valid` with `pending` and then `new_diffs` replayed
/// onto it.
#[derive(Debug)]
pub(crate) struct ControllerState {
    /// The last anchored tree
    pub valid: BrickMap,
    /// What readers see, including unanchored writes
    pub dirty: BrickMap,
    /// Diffs opened since the last sweep; writes go to the last one
    pub new_diffs: Vec<BrickMapDiff>,
    /// Diffs swept into the current (or failed) anchoring round
    pub pending: Vec<BrickMapDiff>,
    /// Head of the alias as of `valid`; new diffs chain onto it
    pub last_valid_hash: Option<String>,
    pub versions: Vec<String>,
    pub initialized: bool,
}

impl ControllerState {
    pub fn new() -> Self {
        Self {
            valid: BrickMap::new(),
            dirty: BrickMap::new(),
            new_diffs: Vec::new(),
            pending: Vec::new(),
            last_valid_hash: None,
            versions: Vec::new(),
            initialized: false,
        }
    }

    /// Start over from an anchored tree, dropping unanchored writes
    pub fn reset(&mut self, valid: BrickMap, versions: Vec<String>) {
        self.dirty = valid.clone();
        self.valid = valid;
        self.last_valid_hash = versions.last().cloned();
        self.versions = versions;
        self.new_diffs.clear();
        self.pending.clear();
        self.initialized = true;
    }

    /// The diff writes currently land in, opened on demand
    pub fn open_diff(&mut self) -> &mut BrickMapDiff {
        if self.new_diffs.is_empty() {
            self.new_diffs
                .push(BrickMapDiff::new(self.last_valid_hash.clone()));
        }
        let last = self.new_diffs.len() - 1;
        &mut self.new_diffs[last]
    }

    /// Move every non-empty new diff behind the pending ones
    pub fn sweep(&mut self) {
        let swept = self.new_diffs.drain(..).filter(BrickMapDiff::has_items);
        self.pending.extend(swept);
    }

    pub fn has_new_items(&self) -> bool {
        self.new_diffs.iter().any(BrickMapDiff::has_items)
    }

    pub fn has_unanchored(&self) -> bool {
        self.has_new_items() || self.pending.iter().any(BrickMapDiff::has_items)
    }
}
