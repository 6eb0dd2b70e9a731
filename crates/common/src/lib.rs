/**
 * Publishing tree versions through an alias store.
 *  - Compare-and-swap alias stores
 *  - Diff and latest-version anchoring strategies
 *  - Conflict resolvers for lost anchoring races
 */
pub mod anchoring;
/**
 * File-level facade pairing a controller with
 *  the storage service.
 */
pub mod archive;
/**
 * Immutable, content-addressed units of data
 *  and the compress/encrypt transforms applied
 *  to them before hashing.
 */
pub mod brick;
/**
 * Path trees over bricks, the diffs recording
 *  changes to them, and the diff/merge/replay
 *  algebra between the two.
 */
pub mod brick_map;
/**
 * Archive-wide settings, loadable from TOML.
 */
pub mod config;
/**
 * The anchoring state machine: valid, dirty and
 *  pending trees, writes, and optimistic-concurrency
 *  anchoring rounds.
 */
pub mod controller;
/**
 * Symmetric keys and AEAD encryption.
 */
pub mod crypto;
/**
 * Brick stores, filesystem access and the
 *  chunking pipeline between them.
 */
pub mod storage;

pub mod prelude {
    pub use crate::anchoring::{
        AliasStore, AnchoringStrategy, MemoryAliasStore, StrategyContext, StrategyOptions,
    };
    pub use crate::archive::{Archive, ArchiveError};
    pub use crate::brick::{Brick, HashLink, Transform};
    pub use crate::brick_map::{BrickMap, BrickMapDiff, BrickMapError, PathTree};
    pub use crate::config::ArchiveConfig;
    pub use crate::controller::{AnchorReceipt, BrickMapController, ControllerError, TreeMutator};
    pub use crate::crypto::Secret;
    pub use crate::storage::{
        BrickStorageService, BrickStore, FsBrickStore, LocalFsAdapter, MemoryBrickStore,
    };
}
