//! Bricks: immutable, content-addressed units of archive data
//!
//! - **[`Brick`]**: raw bytes, their transformed (stored) form and the hash of
//!   the transformed form
//! - **[`Transform`]**: compression followed by authenticated encryption
//! - **[`HashLink`]** / **[`BrickId`]**: how file nodes reference bricks,
//!   including embedded byte-range hints into compacted bricks

#[allow(clippy::module_inception)]
mod brick;
mod hash_link;
mod transform;

pub use brick::{Brick, BrickError};
pub use hash_link::{content_hash, BrickId, BrickIdError, EmbeddedHint, HashLink};
pub use transform::{CompressionAlgorithm, Transform, TransformError, TransformParams};
