//! Publishing tree versions
//!
//! An alias names an append-only list of hashes, each one an anchored
//! version of an archive's tree. The [`AliasStore`] is the only shared
//! mutable state between writers: every append is a compare-and-swap
//! against the head the writer last saw.
//!
//! The [`strategy`] module decides what those hashes point at (diffs or
//! full snapshots) and how a writer that lost a race rebases its changes.

mod alias;
mod memory;
pub mod strategy;

pub use alias::{AliasError, AliasStore};
pub use memory::MemoryAliasStore;
pub use strategy::{
    AnchorDecision, AnchoringStrategy, ConflictResolver, StrategyContext, StrategyError,
    StrategyOptions,
};
