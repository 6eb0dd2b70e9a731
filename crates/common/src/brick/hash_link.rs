use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::Secret;

/// Separator between a brick hash and its hint
const HINT_SEPARATOR: &str = "#hint=";
/// Hint kind for byte ranges inside a compacted brick
const EMBEDDED_HINT: &str = "embedded/";

/// BLAKE3 hex digest used for both brick hashes and raw-content checksums
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// A reference from a file node to one of its bricks
///
/// `hash` may carry an embedded hint (see [`BrickId`]) when the file lives
/// inside a compacted brick. `checksum` is computed over the raw (decoded)
/// content, `key` is the brick's own content key when it was encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashLink {
    pub hash: String,
    #[serde(rename = "checkSum")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Secret>,
}

impl HashLink {
    pub fn new(hash: impl Into<String>, checksum: impl Into<String>, key: Option<Secret>) -> Self {
        Self {
            hash: hash.into(),
            checksum: checksum.into(),
            key,
        }
    }

    /// Parse the brick identifier out of the hash field
    pub fn brick_id(&self) -> Result<BrickId, BrickIdError> {
        self.hash.parse()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BrickIdError {
    #[error("empty brick id")]
    Empty,
    #[error("unsupported hint: {0}")]
    UnsupportedHint(String),
    #[error("malformed embedded hint: {0}")]
    MalformedHint(String),
}

/// Byte range of a file inside a compacted brick's decoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmbeddedHint {
    pub offset: u64,
    pub size: u64,
}

impl EmbeddedHint {
    /// `None` when the range does not fit in memory addresses
    pub fn range(&self) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(self.offset).ok()?;
        let size = usize::try_from(self.size).ok()?;
        Some(start..start.checked_add(size)?)
    }
}

/// Parsed form of `<brick-hash>[#hint=embedded/<offset>,<size>]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrickId {
    hash: String,
    embedded: Option<EmbeddedHint>,
}

impl BrickId {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            embedded: None,
        }
    }

    pub fn embedded(hash: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            hash: hash.into(),
            embedded: Some(EmbeddedHint { offset, size }),
        }
    }

    /// The hash of the stored brick, without any hint
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn hint(&self) -> Option<&EmbeddedHint> {
        self.embedded.as_ref()
    }
}

impl fmt::Display for BrickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.embedded {
            Some(hint) => write!(
                f,
                "{}{}{}{},{}",
                self.hash, HINT_SEPARATOR, EMBEDDED_HINT, hint.offset, hint.size
            ),
            None => write!(f, "{}", self.hash),
        }
    }
}

impl FromStr for BrickId {
    type Err = BrickIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, hint) = match s.split_once(HINT_SEPARATOR) {
            Some((hash, hint)) => (hash, Some(hint)),
            None => (s, None),
        };
        if hash.is_empty() {
            return Err(BrickIdError::Empty);
        }

        let embedded = match hint {
            None => None,
            Some(hint) => {
                let range = hint
                    .strip_prefix(EMBEDDED_HINT)
                    .ok_or_else(|| BrickIdError::UnsupportedHint(hint.to_string()))?;
                let (offset, size) = range
                    .split_once(',')
                    .ok_or_else(|| BrickIdError::MalformedHint(range.to_string()))?;
                let offset = offset
                    .trim()
                    .parse()
                    .map_err(|_| BrickIdError::MalformedHint(range.to_string()))?;
                let size = size
                    .trim()
                    .parse()
                    .map_err(|_| BrickIdError::MalformedHint(range.to_string()))?;
                Some(EmbeddedHint { offset, size })
            }
        };

        Ok(Self {
            hash: hash.to_string(),
            embedded,
        })
    }
}
