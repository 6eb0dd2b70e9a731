//! Authenticated content encryption for bricks
//!
//! Every encrypted brick carries its own framing so that the inverse
//! transform only needs the key:
//!
//! ```text
//! salt (16 bytes) || nonce (12 bytes) || ciphertext || auth tag (16 bytes)
//! ```
//!
//! The salt is not secret. It feeds a BLAKE3 key derivation that produces the
//! additional authenticated data bound to the ciphertext, so a frame cannot be
//! replayed under a different salt without failing authentication.

use std::fmt;
use std::ops::Deref;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Size of an AEAD nonce in bytes (both supported ciphers use 96-bit nonces)
pub const NONCE_SIZE: usize = 12;
/// Size of a content key in bytes (256 bits)
pub const SECRET_SIZE: usize = 32;
/// Size of the per-frame salt in bytes
pub const SALT_SIZE: usize = 16;
/// Size of the AEAD authentication tag in bytes
pub const TAG_SIZE: usize = 16;
/// Context string for deriving additional authenticated data from a salt
const AAD_CONTEXT: &str = "bar brick aad v1";
/// Tag written next to hex key material in the canonical encoding
const BYTES_TAG: &str = "bytes";

pub type Salt = [u8; SALT_SIZE];

/// Errors that can occur during encryption/decryption
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("invalid secret size, expected {SECRET_SIZE}, got {0}")]
    InvalidSize(usize),
    #[error("encrypted frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("salt mismatch between frame and supplied parameters")]
    SaltMismatch,
    #[error("authentication failed")]
    Authentication,
    #[error("random source unavailable: {0}")]
    Rng(String),
}

/// AEAD cipher used to encrypt brick payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionAlgorithm {
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionAlgorithm::ChaCha20Poly1305 => write!(f, "chacha20-poly1305"),
            EncryptionAlgorithm::Aes256Gcm => write!(f, "aes-256-gcm"),
        }
    }
}

/// A 256-bit symmetric key for brick and brick map encryption
///
/// Data bricks each get a fresh `Secret` (stored next to the hash in the
/// brick map), while the brick map itself is encrypted with the archive key.
#[derive(PartialEq, Eq, Clone, Hash)]
pub struct Secret([u8; SECRET_SIZE]);

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

impl Deref for Secret {
    type Target = [u8; SECRET_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

/// Fill a buffer from the operating system RNG
pub fn random_bytes<const N: usize>() -> Result<[u8; N], SecretError> {
    let mut buff = [0u8; N];
    getrandom::getrandom(&mut buff).map_err(|e| SecretError::Rng(e.to_string()))?;
    Ok(buff)
}

/// Derive the additional authenticated data bound to a frame
pub fn derive_aad(salt: &Salt) -> [u8; 32] {
    blake3::derive_key(AAD_CONTEXT, salt)
}

impl Secret {
    /// Generate a new random secret using a cryptographically secure RNG
    pub fn generate() -> Result<Self, SecretError> {
        Ok(Self(random_bytes::<SECRET_SIZE>()?))
    }

    /// Create a secret from a byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self, SecretError> {
        if data.len() != SECRET_SIZE {
            return Err(SecretError::InvalidSize(data.len()));
        }
        let mut buff = [0; SECRET_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    /// Parse a secret from a hex string
    pub fn from_hex(hex: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(hex.trim())
            .map_err(|e| anyhow::anyhow!("secret hex decode error: {}", e))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get a reference to the secret key bytes
    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// Encrypt `data` under this key, binding the AAD derived from `salt`.
    ///
    /// A fresh random nonce is generated for every call, so encrypting the
    /// same plaintext twice yields different frames.
    pub fn encrypt(
        &self,
        algorithm: EncryptionAlgorithm,
        data: &[u8],
        salt: &Salt,
    ) -> Result<Vec<u8>, SecretError> {
        let nonce = random_bytes::<NONCE_SIZE>()?;
        let aad = derive_aad(salt);
        let payload = Payload {
            msg: data,
            aad: &aad,
        };

        let ciphertext = match algorithm {
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(self.bytes()));
                cipher.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
            }
            EncryptionAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(self.bytes()));
                cipher.encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
            }
        }
        .map_err(|_| anyhow::anyhow!("encrypt error"))?;

        let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a frame produced by [`Secret::encrypt`], returning the
    /// plaintext and the salt recovered from the frame.
    pub fn decrypt(
        &self,
        algorithm: EncryptionAlgorithm,
        frame: &[u8],
    ) -> Result<(Vec<u8>, Salt), SecretError> {
        if frame.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(SecretError::FrameTooShort(frame.len()));
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&frame[..SALT_SIZE]);
        let nonce = &frame[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
        let aad = derive_aad(&salt);
        let payload = Payload {
            msg: &frame[SALT_SIZE + NONCE_SIZE..],
            aad: &aad,
        };

        let plaintext = match algorithm {
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(self.bytes()));
                cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
            EncryptionAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(self.bytes()));
                cipher.decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
            }
        }
        .map_err(|_| SecretError::Authentication)?;

        Ok((plaintext, salt))
    }
}

// Key material is written as a tagged hex string: {"type": "bytes", "data": "<hex>"}
impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", BYTES_TAG)?;
        map.serialize_entry("data", &self.to_hex())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TaggedBytes;

        impl<'de> Visitor<'de> for TaggedBytes {
            type Value = Secret;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a tagged byte array or a hex string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Secret, E> {
                Secret::from_hex(v).map_err(E::custom)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Secret, A::Error> {
                let mut tag: Option<String> = None;
                let mut data: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "type" => tag = Some(map.next_value()?),
                        "data" => data = Some(map.next_value()?),
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                match tag.as_deref() {
                    Some(BYTES_TAG) => {}
                    Some(other) => {
                        return Err(de::Error::custom(format!("unknown byte tag: {}", other)))
                    }
                    None => return Err(de::Error::missing_field("type")),
                }
                let data = data.ok_or_else(|| de::Error::missing_field("data"))?;
                Secret::from_hex(&data).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(TaggedBytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ALGORITHMS: [EncryptionAlgorithm; 2] = [
        EncryptionAlgorithm::ChaCha20Poly1305,
        EncryptionAlgorithm::Aes256Gcm,
    ];

    #[test]
    fn test_secret_encrypt_decrypt() {
        let secret = Secret::generate().unwrap();
        let salt = random_bytes::<SALT_SIZE>().unwrap();
        let data = b"hello world, this is a test message for encryption";

        for algorithm in ALGORITHMS {
            let encrypted = secret.encrypt(algorithm, data, &salt).unwrap();
            let (decrypted, recovered_salt) = secret.decrypt(algorithm, &encrypted).unwrap();
            assert_eq!(data.as_slice(), decrypted.as_slice());
            assert_eq!(salt, recovered_salt);
        }
    }

    #[test]
    fn test_secret_size_validation() {
        assert!(matches!(
            Secret::from_slice(&[1u8; 16]),
            Err(SecretError::InvalidSize(16))
        ));
        assert!(Secret::from_slice(&[1u8; 64]).is_err());
        assert!(Secret::from_slice(&[1u8; SECRET_SIZE]).is_ok());
    }

    #[test]
    fn test_tampered_salt_fails_authentication() {
        let secret = Secret::generate().unwrap();
        let salt = [7u8; SALT_SIZE];
        let mut encrypted = secret
            .encrypt(EncryptionAlgorithm::ChaCha20Poly1305, b"payload", &salt)
            .unwrap();

        encrypted[0] ^= 0xFF;
        let result = secret.decrypt(EncryptionAlgorithm::ChaCha20Poly1305, &encrypted);
        assert!(matches!(result, Err(SecretError::Authentication)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let secret = Secret::generate().unwrap();
        let other = Secret::generate().unwrap();
        let salt = [1u8; SALT_SIZE];
        let encrypted = secret
            .encrypt(EncryptionAlgorithm::Aes256Gcm, b"payload", &salt)
            .unwrap();
        assert!(other
            .decrypt(EncryptionAlgorithm::Aes256Gcm, &encrypted)
            .is_err());
    }

    #[test]
    fn test_short_frame() {
        let secret = Secret::generate().unwrap();
        let result = secret.decrypt(EncryptionAlgorithm::Aes256Gcm, &[0u8; 10]);
        assert!(matches!(result, Err(SecretError::FrameTooShort(10))));
    }

    #[test]
    fn test_tagged_serialization() {
        let secret = Secret::from([3u8; SECRET_SIZE]);
        let json = serde_json::to_value(&secret).unwrap();
        assert_eq!(json["type"], "bytes");
        assert_eq!(json["data"], hex::encode([3u8; SECRET_SIZE]));

        let back: Secret = serde_json::from_value(json).unwrap();
        assert_eq!(back, secret);
    }

    #[test]
    fn test_empty_data_encryption() {
        let secret = Secret::generate().unwrap();
        let salt = [0u8; SALT_SIZE];
        let encrypted = secret
            .encrypt(EncryptionAlgorithm::ChaCha20Poly1305, b"", &salt)
            .unwrap();
        let (decrypted, _) = secret
            .decrypt(EncryptionAlgorithm::ChaCha20Poly1305, &encrypted)
            .unwrap();
        assert!(decrypted.is_empty());
    }
}
