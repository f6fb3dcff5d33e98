//! Password-encrypted backup archives.
//!
//! A backup encrypts every file of a source tree with a key derived from a
//! password and a persisted salt, and packs the ciphertexts into one ZIP
//! archive. A restore reverses this into a second archive holding the
//! plaintexts.

mod archive;
mod cancel;
pub mod config;
pub mod crypto;
mod error;
pub mod pipeline;
mod staging;
mod storage;
mod walk;

pub use crate::archive::{ArchiveReader, ArchiveWriter, ExtractError, Extracted};
pub use crate::cancel::CancelFlag;
pub use crate::config::Config;
pub use crate::crypto::{FileCipher, KdfParams, Salt, SaltPolicy, SaltStore};
pub use crate::error::{Error, Result};
pub use crate::pipeline::{ArchivePipeline, PipelineError, RunReport, SkipReason, SkippedFile, Stage};
pub use crate::staging::leftover_staging_dirs;

use std::path::Path;

use tracing::debug;
use zeroize::Zeroizing;

/// One password-unlocked session: the resolved salt plus a pipeline holding
/// the derived key.
pub struct Backvault {
    pipeline: ArchivePipeline,
    salt: Salt,
}

impl Backvault {
    /// Generates and persists a new salt. Fails if one already exists.
    pub fn init(password: Zeroizing<String>, config: &Config) -> Result<Self> {
        Self::with_policy(password, config, SaltPolicy::CreateNew)
    }

    /// Uses the persisted salt. Fails if there is none.
    pub fn open(password: Zeroizing<String>, config: &Config) -> Result<Self> {
        Self::with_policy(password, config, SaltPolicy::RequireExisting)
    }

    /// Uses the persisted salt, creating it on first use.
    pub fn open_or_init(password: Zeroizing<String>, config: &Config) -> Result<Self> {
        Self::with_policy(password, config, SaltPolicy::CreateIfMissing)
    }

    pub fn with_policy(
        password: Zeroizing<String>,
        config: &Config,
        policy: SaltPolicy,
    ) -> Result<Self> {
        let store = SaltStore::new(config.salt_path.clone()).with_salt_len(config.salt_len);
        let salt = store.resolve(policy)?;

        let key = crypto::derive_key(&password, &salt, config.kdf)?;
        drop(password);
        debug!(salt = ?salt, "derived archive key");

        let mut pipeline = ArchivePipeline::new(FileCipher::new(key));
        if let Some(root) = &config.staging_root {
            pipeline = pipeline.with_staging_root(root.clone());
        }
        if let Some(workers) = config.workers {
            pipeline = pipeline.with_workers(workers);
        }

        Ok(Self { pipeline, salt })
    }

    /// Lets `cancel` abort runs of this session.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.pipeline = self.pipeline.with_cancel_flag(cancel);
        self
    }

    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    /// Backs up `source_dir` into a new archive in `backup_dir`.
    pub fn create_backup(
        &self,
        source_dir: &Path,
        backup_dir: &Path,
    ) -> std::result::Result<RunReport, PipelineError> {
        self.pipeline.backup(source_dir, backup_dir)
    }

    /// Restores `archive` into a new archive in `restore_dir`.
    pub fn restore_backup(
        &self,
        archive: &Path,
        restore_dir: &Path,
    ) -> std::result::Result<RunReport, PipelineError> {
        self.pipeline.restore(archive, restore_dir)
    }
}

/// Entry names of the archive at `path`.
pub fn list_archive(path: &Path) -> Result<Vec<String>> {
    Ok(ArchiveReader::open(path)?.entry_names())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::*;

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::with_salt_path(dir.join("salt.salt"));
        config.kdf = KdfParams::new(10, 8, 1).unwrap();
        config
    }

    fn pw(s: &str) -> Zeroizing<String> {
        Zeroizing::new(s.to_string())
    }

    #[test]
    fn open_fails_without_salt() {
        let dir = tempdir().unwrap();

        assert!(matches!(
            Backvault::open(pw("pw"), &config_in(dir.path())),
            Err(Error::SaltNotFound(_))
        ));
    }

    #[test]
    fn init_fails_if_salt_exists() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        Backvault::init(pw("pw"), &config).unwrap();
        assert!(matches!(
            Backvault::init(pw("pw"), &config),
            Err(Error::SaltExists(_))
        ));
    }

    #[test]
    fn empty_password_is_rejected() {
        let dir = tempdir().unwrap();

        assert!(matches!(
            Backvault::open_or_init(pw(""), &config_in(dir.path())),
            Err(Error::KeyDerivation(_))
        ));
    }

    #[test]
    fn reopened_session_decrypts_earlier_backup() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let source = dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), b"hello").unwrap();

        let report = Backvault::init(pw("pw"), &config)
            .unwrap()
            .create_backup(&source, &dir.path().join("backup"))
            .unwrap();

        let session = Backvault::open(pw("pw"), &config).unwrap();
        let restored = session
            .restore_backup(&report.archive, &dir.path().join("restore"))
            .unwrap();

        assert_eq!(restored.entries, vec!["a.txt"]);
        assert!(!restored.is_partial());
    }

    #[test]
    fn list_archive_reports_entries() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let source = dir.path().join("source");
        fs::create_dir_all(source.join("b")).unwrap();
        fs::write(source.join("a.txt"), b"hello").unwrap();
        fs::write(source.join("b").join("c.txt"), b"world").unwrap();

        let report = Backvault::open_or_init(pw("pw"), &config)
            .unwrap()
            .create_backup(&source, &dir.path().join("backup"))
            .unwrap();

        assert_eq!(list_archive(&report.archive).unwrap(), vec!["a.txt", "b/c.txt"]);
        assert!(matches!(
            list_archive(&PathBuf::from("/definitely/not/here.zip")),
            Err(Error::ArchiveNotFound(_))
        ));
    }
}
