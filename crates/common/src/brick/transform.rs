//! Reversible byte transforms applied to brick payloads
//!
//! The direct transform compresses first and encrypts second; the inverse
//! runs the same steps backwards. With nothing configured the transform is
//! the identity and a brick's hash is taken over its raw content.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::crypto::{random_bytes, EncryptionAlgorithm, Salt, Secret, SecretError, SALT_SIZE};

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
    #[error("inverse transform requires a key")]
    MissingKey,
}

/// Dictionary-free compression applied before encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionAlgorithm {
    Gzip,
    Brotli,
    /// zlib-wrapped deflate
    Deflate,
    DeflateRaw,
}

impl CompressionAlgorithm {
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        match self {
            CompressionAlgorithm::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            CompressionAlgorithm::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            CompressionAlgorithm::DeflateRaw => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            CompressionAlgorithm::Brotli => {
                let mut writer = brotli::CompressorWriter::new(
                    Vec::new(),
                    BROTLI_BUFFER_SIZE,
                    BROTLI_QUALITY,
                    BROTLI_WINDOW,
                );
                writer.write_all(data)?;
                writer.flush()?;
                Ok(writer.into_inner())
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut out = Vec::new();
        match self {
            CompressionAlgorithm::Gzip => {
                GzDecoder::new(data).read_to_end(&mut out)?;
            }
            CompressionAlgorithm::Deflate => {
                ZlibDecoder::new(data).read_to_end(&mut out)?;
            }
            CompressionAlgorithm::DeflateRaw => {
                DeflateDecoder::new(data).read_to_end(&mut out)?;
            }
            CompressionAlgorithm::Brotli => {
                brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }
}

/// Parameters needed to reverse a transform
///
/// Produced by [`Transform::direct`]; callers must hand the same values back
/// to [`Transform::inverse`]. The salt also travels inside the encrypted frame
/// and is only checked against when supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformParams {
    pub key: Option<Secret>,
    pub salt: Option<Salt>,
}

impl TransformParams {
    pub fn with_key(key: Secret) -> Self {
        Self {
            key: Some(key),
            salt: None,
        }
    }

    /// Fill in any missing values from `other`; present values are kept
    pub fn merge(&mut self, other: TransformParams) {
        if self.key.is_none() {
            self.key = other.key;
        }
        if self.salt.is_none() {
            self.salt = other.salt;
        }
    }
}

/// A compression + encryption pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transform {
    compression: Option<CompressionAlgorithm>,
    encryption: Option<EncryptionAlgorithm>,
}

impl Transform {
    pub fn new(
        compression: Option<CompressionAlgorithm>,
        encryption: Option<EncryptionAlgorithm>,
    ) -> Self {
        Self {
            compression,
            encryption,
        }
    }

    pub fn identity() -> Self {
        Self::default()
    }

    pub fn is_identity(&self) -> bool {
        self.compression.is_none() && self.encryption.is_none()
    }

    pub fn compression(&self) -> Option<CompressionAlgorithm> {
        self.compression
    }

    pub fn encryption(&self) -> Option<EncryptionAlgorithm> {
        self.encryption
    }

    /// Apply compression then encryption.
    ///
    /// A missing key or salt is generated, and the returned params always
    /// contain whatever is needed to invert the result.
    pub fn direct(
        &self,
        raw: &[u8],
        params: &TransformParams,
    ) -> Result<(Bytes, TransformParams), TransformError> {
        let compressed = match self.compression {
            Some(algorithm) => algorithm.compress(raw)?,
            None => raw.to_vec(),
        };

        let Some(algorithm) = self.encryption else {
            return Ok((Bytes::from(compressed), params.clone()));
        };

        let key = match &params.key {
            Some(key) => key.clone(),
            None => Secret::generate()?,
        };
        let salt = match params.salt {
            Some(salt) => salt,
            None => random_bytes::<SALT_SIZE>()?,
        };
        let encrypted = key.encrypt(algorithm, &compressed, &salt)?;

        Ok((
            Bytes::from(encrypted),
            TransformParams {
                key: Some(key),
                salt: Some(salt),
            },
        ))
    }

    /// Reverse [`Transform::direct`]
    pub fn inverse(
        &self,
        transformed: &[u8],
        params: &TransformParams,
    ) -> Result<Bytes, TransformError> {
        let decrypted = match self.encryption {
            Some(algorithm) => {
                let key = params.key.as_ref().ok_or(TransformError::MissingKey)?;
                let (plaintext, salt) = key.decrypt(algorithm, transformed)?;
                if params.salt.is_some_and(|expected| expected != salt) {
                    return Err(SecretError::SaltMismatch.into());
                }
                plaintext
            }
            None => transformed.to_vec(),
        };

        match self.compression {
            Some(algorithm) => Ok(Bytes::from(algorithm.decompress(&decrypted)?)),
            None => Ok(Bytes::from(decrypted)),
        }
    }
}
