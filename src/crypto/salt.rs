//! Salt generation and persistence.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use super::{DEFAULT_SALT_LEN, secure_random};
use crate::error::{Error, Result};
use crate::storage::Storage;

/// Serializes every salt write inside the process.
static SALT_WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Random value mixed into key derivation.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt(Vec<u8>);

impl Salt {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({} bytes)", self.0.len())
    }
}

/// Generates `size` bytes of salt from the OS CSPRNG.
pub fn generate_salt(size: usize) -> Result<Salt> {
    let mut salt = vec![0u8; size];
    secure_random(&mut salt)?;
    Ok(Salt(salt))
}

/// Reads the raw salt bytes stored at `path`.
///
/// # Errors
///
/// Returns [`Error::SaltNotFound`] when nothing is stored at `path`, so the
/// caller can decide whether a missing salt is fatal.
pub fn load_salt(path: &Path) -> Result<Salt> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Salt(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::SaltNotFound(path.to_path_buf())),
        Err(e) => Err(Error::fs("read salt file", path, e)),
    }
}

/// Writes `salt` to `path`, replacing whatever is there.
pub fn save_salt(salt: &Salt, path: &Path) -> Result<()> {
    let _guard = SALT_WRITE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    Storage::new(path.to_path_buf()).save(salt.as_bytes())
}

/// How a run obtains its salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaltPolicy {
    /// Load the persisted salt; fail if there is none.
    RequireExisting,
    /// Load the persisted salt, or generate and persist one on first use.
    CreateIfMissing,
    /// Generate and persist a fresh salt; fail if one already exists.
    CreateNew,
}

/// The well-known salt file shared by every run in the process.
#[derive(Debug, Clone)]
pub struct SaltStore {
    path: PathBuf,
    salt_len: usize,
}

impl SaltStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            salt_len: DEFAULT_SALT_LEN,
        }
    }

    /// Overrides the size of newly generated salts.
    pub fn with_salt_len(mut self, salt_len: usize) -> Self {
        self.salt_len = salt_len;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Salt> {
        load_salt(&self.path)
    }

    /// Resolves the salt for one run according to `policy`.
    ///
    /// Check-then-create happens under the process-wide write lock, so two
    /// concurrent runs never both generate a salt.
    pub fn resolve(&self, policy: SaltPolicy) -> Result<Salt> {
        if policy == SaltPolicy::RequireExisting {
            return self.load();
        }

        let _guard = SALT_WRITE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        if self.exists() {
            if policy == SaltPolicy::CreateNew {
                return Err(Error::SaltExists(self.path.clone()));
            }
            debug!(path = %self.path.display(), "using existing salt");
            return self.load();
        }

        let salt = generate_salt(self.salt_len)?;
        Storage::new(self.path.clone()).save(salt.as_bytes())?;
        info!(path = %self.path.display(), "generated new salt");
        Ok(salt)
    }
}
