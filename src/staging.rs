//! Ephemeral working directory for one pipeline run.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const STAGING_PREFIX: &str = ".backvault-staging-";

/// Directory holding per-file intermediates of a single run.
///
/// The directory and everything in it is removed by [`StagingArea::close`],
/// or on drop for every other exit path (errors, cancellation, unwinding).
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    /// Creates a fresh staging directory inside `parent`.
    pub fn create(parent: &Path) -> Result<Self> {
        fs::create_dir_all(parent).map_err(|e| Error::fs("create directory", parent, e))?;

        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(parent)
            .map_err(|e| Error::fs("create staging directory in", parent, e))?;

        debug!(path = %dir.path().display(), "created staging area");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of `relative` inside the staging area.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Writes `data` to `relative`, creating intermediate directories.
    pub fn write(&self, relative: &Path, data: &[u8]) -> Result<PathBuf> {
        let target = self.resolve(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::fs("create directory", parent, e))?;
        }
        fs::write(&target, data).map_err(|e| Error::fs("write", &target, e))?;
        Ok(target)
    }

    pub fn read(&self, relative: &Path) -> Result<Vec<u8>> {
        let source = self.resolve(relative);
        fs::read(&source).map_err(|e| Error::fs("read", &source, e))
    }

    /// Removes the staging directory, reporting failures.
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to remove staging area");
            Error::fs("remove staging directory", &path, e)
        })?;
        debug!(path = %path.display(), "removed staging area");
        Ok(())
    }
}

/// Staging directories currently present in `parent`.
pub fn leftover_staging_dirs(parent: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::fs("read directory", parent, e)),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::fs("read directory", parent, e))?;
        if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            found.push(entry.path());
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn close_removes_everything() {
        let parent = tempdir().unwrap();
        let staging = StagingArea::create(parent.path()).unwrap();

        staging.write(Path::new("b/c.txt"), b"world").unwrap();
        assert_eq!(staging.read(Path::new("b/c.txt")).unwrap(), b"world");

        let path = staging.path().to_path_buf();
        staging.close().unwrap();

        assert!(!path.exists());
        assert!(leftover_staging_dirs(parent.path()).unwrap().is_empty());
    }

    #[test]
    fn drop_removes_everything() {
        let parent = tempdir().unwrap();
        {
            let staging = StagingArea::create(parent.path()).unwrap();
            staging.write(Path::new("secret.bin"), b"key material").unwrap();
            assert_eq!(leftover_staging_dirs(parent.path()).unwrap().len(), 1);
        }

        assert!(leftover_staging_dirs(parent.path()).unwrap().is_empty());
    }

    #[test]
    fn each_run_gets_a_fresh_directory() {
        let parent = tempdir().unwrap();
        let a = StagingArea::create(parent.path()).unwrap();
        let b = StagingArea::create(parent.path()).unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(parent.path()));
    }
}
