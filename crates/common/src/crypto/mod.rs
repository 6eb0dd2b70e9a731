//! Cryptographic primitives for bar archives
//!
//! - **Content keys**: 256-bit [`Secret`]s, one per encrypted data brick plus
//!   the archive key that protects serialized brick maps
//! - **Ciphers**: ChaCha20-Poly1305 and AES-256-GCM, selected per archive via
//!   [`EncryptionAlgorithm`]
//! - **AAD binding**: every frame carries a random salt; the authenticated data
//!   is derived from it with BLAKE3 key derivation
//!
//! Bricks are addressed by the hash of their *encrypted* form, so encryption
//! never weakens content addressing: a tampered frame fails both the hash check
//! and AEAD authentication.

mod secret;

pub use secret::{
    derive_aad, random_bytes, EncryptionAlgorithm, Salt, Secret, SecretError, NONCE_SIZE,
    SALT_SIZE, SECRET_SIZE, TAG_SIZE,
};
