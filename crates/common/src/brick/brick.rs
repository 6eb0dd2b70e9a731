use bytes::Bytes;

use super::hash_link::{content_hash, HashLink};
use super::transform::{Transform, TransformError, TransformParams};

#[derive(Debug, thiserror::Error)]
pub enum BrickError {
    #[error("brick has no data")]
    NoData,
    #[error("brick is immutable once hashed")]
    Immutable,
    #[error("invalid data: expected hash {expected}, got {actual}")]
    InvalidData { expected: String, actual: String },
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
}

/// An immutable, content-addressed unit of archive data
///
/// A brick holds raw bytes, transformed (stored) bytes, or both. Whichever
/// side is missing is derived on first request and cached; the hash is
/// always computed over the transformed bytes.
#[derive(Debug, Clone)]
pub struct Brick {
    raw: Option<Bytes>,
    transformed: Option<Bytes>,
    hash: Option<String>,
    transform: Transform,
    params: TransformParams,
}

impl Brick {
    pub fn new(transform: Transform) -> Self {
        Self {
            raw: None,
            transformed: None,
            hash: None,
            transform,
            params: TransformParams::default(),
        }
    }

    pub fn from_raw(raw: impl Into<Bytes>, transform: Transform) -> Self {
        let mut brick = Self::new(transform);
        brick.raw = Some(raw.into());
        brick
    }

    /// Rebuild a brick from its stored form, verifying it against `expected_hash`.
    ///
    /// The raw content is only recoverable if `params` carries what the
    /// inverse transform needs.
    pub fn from_stored(
        expected_hash: &str,
        transformed: Bytes,
        transform: Transform,
        params: TransformParams,
    ) -> Result<Self, BrickError> {
        let actual = content_hash(&transformed);
        if actual != expected_hash {
            return Err(BrickError::InvalidData {
                expected: expected_hash.to_string(),
                actual,
            });
        }
        Ok(Self {
            raw: None,
            transformed: Some(transformed),
            hash: Some(actual),
            transform,
            params,
        })
    }

    pub fn set_raw(&mut self, raw: impl Into<Bytes>) -> Result<(), BrickError> {
        if self.hash.is_some() || self.transformed.is_some() {
            return Err(BrickError::Immutable);
        }
        self.raw = Some(raw.into());
        Ok(())
    }

    pub fn get_raw(&mut self) -> Result<Bytes, BrickError> {
        if let Some(raw) = &self.raw {
            return Ok(raw.clone());
        }
        let transformed = self.transformed.as_ref().ok_or(BrickError::NoData)?;
        let raw = self.transform.inverse(transformed, &self.params)?;
        self.raw = Some(raw.clone());
        Ok(raw)
    }

    pub fn get_transformed(&mut self) -> Result<Bytes, BrickError> {
        if let Some(transformed) = &self.transformed {
            return Ok(transformed.clone());
        }
        let raw = self.raw.as_ref().ok_or(BrickError::NoData)?;
        if self.transform.is_identity() {
            self.transformed = Some(raw.clone());
            return Ok(raw.clone());
        }
        let (transformed, params) = self.transform.direct(raw, &self.params)?;
        self.params.merge(params);
        self.transformed = Some(transformed.clone());
        Ok(transformed)
    }

    pub fn get_hash(&mut self) -> Result<String, BrickError> {
        if let Some(hash) = &self.hash {
            return Ok(hash.clone());
        }
        let transformed = self.get_transformed()?;
        let hash = content_hash(&transformed);
        self.hash = Some(hash.clone());
        Ok(hash)
    }

    /// Checksum of the raw content
    pub fn checksum(&mut self) -> Result<String, BrickError> {
        let raw = self.get_raw()?;
        Ok(content_hash(&raw))
    }

    /// Merge parameters into the existing set; keys already present win
    pub fn set_transform_params(&mut self, params: TransformParams) {
        self.params.merge(params);
    }

    pub fn get_transform_params(&self) -> &TransformParams {
        &self.params
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Size of the raw content in bytes
    pub fn raw_len(&mut self) -> Result<usize, BrickError> {
        Ok(self.get_raw()?.len())
    }

    /// The reference a file node stores for this brick
    pub fn hash_link(&mut self) -> Result<HashLink, BrickError> {
        let hash = self.get_hash()?;
        let checksum = self.checksum()?;
        Ok(HashLink::new(hash, checksum, self.params.key.clone()))
    }
}
