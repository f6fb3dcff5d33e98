//! Cryptographic primitives for backup archives.
//!
//! Provides salt management, scrypt key derivation and per-file
//! authenticated encryption.

pub mod aead;
pub mod blob;
pub mod kdf;
pub mod salt;

pub use aead::FileCipher;
pub use blob::EncryptedBlob;
pub use kdf::{DerivedKey, KdfParams, derive_key};
pub use salt::{Salt, SaltPolicy, SaltStore, generate_salt, load_salt, save_salt};

use crate::error::{Error, Result};

/// Length of a newly generated salt (16 bytes).
pub const DEFAULT_SALT_LEN: usize = 16;
/// Shortest salt accepted by key derivation.
pub const MIN_SALT_LEN: usize = 8;
/// Length of the nonce (24 bytes for XChaCha20-Poly1305).
pub const NONCE_LEN: usize = 24;
/// Length of the Poly1305 tag.
pub const TAG_LEN: usize = 16;
/// Length of the encryption key (32 bytes / 256 bits).
pub const KEY_LEN: usize = 32;

/// Fill buffer with cryptographically secure random bytes
pub(crate) fn secure_random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|_| Error::Random)
}
