//! Encrypted file format.
//!
//! V1 layout:
//! ```text
//! MAGIC (4) | VERSION (1) | CREATED_AT (8, LE unix seconds) | NONCE (24) | CIPHERTEXT + TAG
//! ```
//!
//! Everything before the ciphertext is authenticated as associated data.

use super::{NONCE_LEN, TAG_LEN};
use crate::error::{Error, Result};

/// Magic bytes identifying an encrypted backup member ("BVLT").
pub const MAGIC: &[u8; 4] = b"BVLT";
pub const MAGIC_LEN: usize = 4;
pub const VER_LEN: usize = 1;
pub const TIME_LEN: usize = 8;
pub const VERSION_V1: u8 = 1;

pub const HEADER_LEN: usize = MAGIC_LEN + VER_LEN + TIME_LEN + NONCE_LEN;

/// Ciphertext of one file together with everything needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    version: u8,
    created_at: u64,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub(crate) fn new(created_at: u64, nonce: [u8; NONCE_LEN], ciphertext: Vec<u8>) -> Self {
        Self {
            version: VERSION_V1,
            created_at,
            nonce,
            ciphertext,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Unix time (seconds) at which the blob was encrypted.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Header bytes, also used as AEAD associated data.
    pub(crate) fn header(&self) -> [u8; HEADER_LEN] {
        header_bytes(self.version, self.created_at, &self.nonce)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        buf.extend_from_slice(&self.header());
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    /// Parses a serialized blob.
    ///
    /// Malformed input is reported as [`Error::Authentication`]: a truncated
    /// or rewritten header cannot be told apart from tampering.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + TAG_LEN {
            return Err(Error::Authentication);
        }

        if &data[..MAGIC_LEN] != MAGIC {
            return Err(Error::Authentication);
        }

        let version = data[MAGIC_LEN];
        if version != VERSION_V1 {
            return Err(Error::Authentication);
        }

        let mut offset = MAGIC_LEN + VER_LEN;

        let mut time = [0u8; TIME_LEN];
        time.copy_from_slice(&data[offset..offset + TIME_LEN]);
        let created_at = u64::from_le_bytes(time);
        offset += TIME_LEN;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[offset..offset + NONCE_LEN]);
        offset += NONCE_LEN;

        Ok(Self {
            version,
            created_at,
            nonce,
            ciphertext: data[offset..].to_vec(),
        })
    }
}

fn header_bytes(version: u8, created_at: u64, nonce: &[u8; NONCE_LEN]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..MAGIC_LEN].copy_from_slice(MAGIC);
    header[MAGIC_LEN] = version;
    let time_at = MAGIC_LEN + VER_LEN;
    header[time_at..time_at + TIME_LEN].copy_from_slice(&created_at.to_le_bytes());
    header[time_at + TIME_LEN..].copy_from_slice(nonce);
    header
}
