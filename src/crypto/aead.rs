use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::Zeroizing;

use super::{DerivedKey, EncryptedBlob, NONCE_LEN, secure_random};
use crate::error::{Error, Result};

/// Authenticated whole-file encryption under one derived key.
///
/// Never touches the filesystem; callers own all I/O.
pub struct FileCipher {
    key: DerivedKey,
}

impl FileCipher {
    pub fn new(key: DerivedKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()))
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob> {
        let mut nonce = [0u8; NONCE_LEN];
        secure_random(&mut nonce)?;

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let aad = EncryptedBlob::new(created_at, nonce, Vec::new()).header();

        let ciphertext = self
            .cipher()
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Encryption)?;

        Ok(EncryptedBlob::new(created_at, nonce, ciphertext))
    }

    /// Decrypts a blob produced by [`FileCipher::encrypt`] under the same key.
    ///
    /// # Errors
    ///
    /// [`Error::Authentication`] if the key does not match or any byte of the
    /// blob was modified.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Zeroizing<Vec<u8>>> {
        let aad = blob.header();

        let plaintext = self
            .cipher()
            .decrypt(
                XNonce::from_slice(blob.nonce()),
                Payload {
                    msg: blob.ciphertext(),
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Authentication)?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Parses and decrypts a serialized blob.
    pub fn decrypt_bytes(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.decrypt(&EncryptedBlob::from_bytes(data)?)
    }

    /// Like [`FileCipher::decrypt`], but also rejects blobs encrypted more
    /// than `max_age` ago.
    pub fn decrypt_with_max_age(
        &self,
        blob: &EncryptedBlob,
        max_age: Duration,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let plaintext = self.decrypt(blob)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now.saturating_sub(blob.created_at()) > max_age.as_secs() {
            return Err(Error::Expired {
                created_at: blob.created_at(),
            });
        }

        Ok(plaintext)
    }
}
