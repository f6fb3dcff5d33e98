use scrypt::Params;
use std::fmt;
use zeroize::Zeroize;

use super::{KEY_LEN, MIN_SALT_LEN, Salt};
use crate::error::{Error, Result};

/// scrypt cost parameters.
///
/// The defaults (N = 2^14, r = 8, p = 1) are part of the on-disk contract:
/// archives encrypted with one set of parameters can only be decrypted with
/// a key derived from the very same set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    log_n: u8,
    r: u32,
    p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            // N = 16384
            log_n: 14,
            // block size
            r: 8,
            // parallelization
            p: 1,
        }
    }
}

impl KdfParams {
    pub fn new(log_n: u8, r: u32, p: u32) -> Result<Self> {
        let params = Self { log_n, r, p };
        params.validate()?;
        Ok(params)
    }

    pub fn log_n(&self) -> u8 {
        self.log_n
    }

    pub fn r(&self) -> u32 {
        self.r
    }

    pub fn p(&self) -> u32 {
        self.p
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_n == 0 || self.log_n > 20 {
            return Err(Error::KeyDerivation(format!(
                "scrypt log_n must be in 1..=20, got {}",
                self.log_n
            )));
        }
        if self.r < 1 {
            return Err(Error::KeyDerivation("scrypt r must be >= 1".into()));
        }
        if self.p < 1 {
            return Err(Error::KeyDerivation("scrypt p must be >= 1".into()));
        }
        Ok(())
    }
}

/// 256-bit key derived from a password. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Derives the archive key from `password` and `salt` with scrypt.
///
/// # Errors
///
/// Fails with [`Error::KeyDerivation`] if the password is empty, the salt is
/// shorter than [`MIN_SALT_LEN`] bytes or the parameters are invalid.
pub fn derive_key(password: &str, salt: &Salt, kdf: KdfParams) -> Result<DerivedKey> {
    if password.is_empty() {
        return Err(Error::KeyDerivation("password must not be empty".into()));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(Error::KeyDerivation(format!(
            "salt is {} bytes, at least {MIN_SALT_LEN} required",
            salt.len()
        )));
    }
    kdf.validate()?;

    let params = Params::new(kdf.log_n, kdf.r, kdf.p, KEY_LEN)
        .map_err(|e| Error::KeyDerivation(format!("invalid scrypt parameters: {e}")))?;

    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(password.as_bytes(), salt.as_bytes(), &params, &mut key)
        .map_err(|e| Error::KeyDerivation(format!("scrypt failed: {e}")))?;

    Ok(DerivedKey(key))
}
