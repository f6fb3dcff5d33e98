//! Run configuration.

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::crypto::{DEFAULT_SALT_LEN, KdfParams};

pub const SALT_FILE_NAME: &str = "salt.salt";

/// Settings shared by every run in the process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Well-known location of the persisted salt.
    pub salt_path: PathBuf,
    /// Size of newly generated salts.
    pub salt_len: usize,
    /// Parent directory for staging areas; the output directory when unset.
    pub staging_root: Option<PathBuf>,
    /// Worker threads for per-file encryption; rayon's default when unset.
    pub workers: Option<usize>,
    pub kdf: KdfParams,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_salt_path(default_salt_path())
    }
}

impl Config {
    pub fn with_salt_path(salt_path: PathBuf) -> Self {
        Self {
            salt_path,
            salt_len: DEFAULT_SALT_LEN,
            staging_root: None,
            workers: None,
            kdf: KdfParams::default(),
        }
    }
}

/// Platform data directory, falling back to the working directory.
pub fn default_salt_path() -> PathBuf {
    match ProjectDirs::from("", "", "backvault") {
        Some(dirs) => dirs.data_dir().join(SALT_FILE_NAME),
        None => PathBuf::from(SALT_FILE_NAME),
    }
}
