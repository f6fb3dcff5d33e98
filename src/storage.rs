//! Crash-safe whole-file writes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::crypto::secure_random;
use crate::error::{Error, Result};

/// A single file that is always replaced atomically.
///
/// Used for the salt file: a crash mid-write leaves either the previous salt
/// or the new one, never a truncated salt that would silently change every
/// derived key.
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Saves data using an atomic write.
    ///
    /// 1. Writes data to a temporary file with a random name
    /// 2. Syncs the temporary file to disk
    /// 3. Atomically replaces the old file with the new one
    /// 4. Syncs the parent directory so the rename is persisted
    ///
    /// Creates parent directories if they don't exist.
    pub fn save(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::fs("create directory", parent, e))?;
        }

        let tmp_path = self.random_tmp_path()?;

        // fail if exists
        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|e| Error::fs("create temporary file", &tmp_path, e))?;

        let written = tmp_file
            .write_all(data)
            .and_then(|()| tmp_file.sync_all());
        drop(tmp_file);

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::fs("write", &tmp_path, e));
        }

        if let Err(e) = self.atomic_replace(&tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::fs("replace", &self.path, e));
        }

        // fsync directory
        if let Some(parent) = self.path.parent() {
            File::open(parent)
                .and_then(|dir| dir.sync_all())
                .map_err(|e| Error::fs("sync directory", parent, e))?;
        }

        Ok(())
    }

    /// Unique temporary path next to the target: `filename.tmp.<randomhex>`.
    fn random_tmp_path(&self) -> Result<PathBuf> {
        let mut buf = [0u8; 8]; // 64 bit entropy
        secure_random(&mut buf)?;

        let rand_string = buf.iter().map(|b| format!("{:02x}", b)).collect::<String>();

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "storage".to_string());

        Ok(self
            .path
            .with_file_name(format!("{file_name}.tmp.{rand_string}")))
    }

    /// Uses `ReplaceFileW` with `REPLACEFILE_WRITE_THROUGH` so the swap is
    /// atomic and persisted. Falls back to a rename when the target does not
    /// exist yet, since `ReplaceFileW` requires an existing file.
    #[cfg(target_os = "windows")]
    fn atomic_replace(&self, tmp_path: &Path) -> std::io::Result<()> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{REPLACEFILE_WRITE_THROUGH, ReplaceFileW};

        if !self.path.exists() {
            return fs::rename(tmp_path, &self.path);
        }

        fn to_wide(s: &OsStr) -> Vec<u16> {
            s.encode_wide().chain(std::iter::once(0)).collect()
        }

        let target_w = to_wide(self.path.as_os_str());
        let tmp_w = to_wide(tmp_path.as_os_str());

        // SAFETY:
        // - Strings are valid UTF-16 and null-terminated
        // - Pointers remain valid during the call
        // - Windows does not retain the pointers after return
        let result = unsafe {
            ReplaceFileW(
                target_w.as_ptr(),
                tmp_w.as_ptr(),
                std::ptr::null(),
                REPLACEFILE_WRITE_THROUGH,
                std::ptr::null(),
                std::ptr::null(),
            )
        };

        if result == 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    }

    /// On Unix, `rename()` is atomic when both paths are on the same filesystem.
    #[cfg(not(target_os = "windows"))]
    fn atomic_replace(&self, tmp_path: &Path) -> std::io::Result<()> {
        fs::rename(tmp_path, &self.path)
    }
}
