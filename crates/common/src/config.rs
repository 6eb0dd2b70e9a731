use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::brick::{CompressionAlgorithm, Transform};
use crate::crypto::{EncryptionAlgorithm, Secret};

pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Archive-wide settings
///
/// Shared immutably by the storage service (chunk size, transform) and by
/// brick maps when they serialize themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Size of a data brick in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub compression: Option<CompressionAlgorithm>,
    #[serde(default)]
    pub encryption: Option<EncryptionAlgorithm>,
    /// Key protecting serialized brick maps when encryption is enabled
    #[serde(default)]
    pub map_encryption_key: Option<Secret>,
    /// Attempts per anchoring round before giving up on version conflicts
    #[serde(default = "default_max_anchoring_attempts")]
    pub max_anchoring_attempts: u32,
    /// Number of fetched bricks kept in memory by the storage service
    #[serde(default = "default_brick_cache_capacity")]
    pub brick_cache_capacity: usize,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_max_anchoring_attempts() -> u32 {
    5
}

fn default_brick_cache_capacity() -> usize {
    128
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            compression: None,
            encryption: None,
            map_encryption_key: None,
            max_anchoring_attempts: default_max_anchoring_attempts(),
            brick_cache_capacity: default_brick_cache_capacity(),
        }
    }
}

impl ArchiveConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".into()));
        }
        if self.max_anchoring_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_anchoring_attempts must be positive".into(),
            ));
        }
        if self.brick_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "brick_cache_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionAlgorithm, map_key: Secret) -> Self {
        self.encryption = Some(encryption);
        self.map_encryption_key = Some(map_key);
        self
    }

    /// The transform applied to every brick written for this archive
    pub fn transform(&self) -> Transform {
        Transform::new(self.compression, self.encryption)
    }
}
