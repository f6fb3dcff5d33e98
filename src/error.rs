//! Error types for key derivation, encryption and the archive pipeline.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Every failure the library can report.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad KDF parameters, empty password or a salt that is too short.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// A salt was required but none has been persisted yet.
    #[error("no salt found at {}", .0.display())]
    SaltNotFound(PathBuf),

    /// Creating a new salt would orphan archives encrypted under the existing one.
    #[error("a salt already exists at {}; refusing to replace it", .0.display())]
    SaltExists(PathBuf),

    /// Ciphertext failed its integrity check.
    #[error("authentication failed: wrong password or corrupted data")]
    Authentication,

    /// Ciphertext authenticated but is older than the accepted age.
    #[error("encrypted data expired (created at unix time {created_at})")]
    Expired { created_at: u64 },

    #[error("archive not found: {}", .0.display())]
    ArchiveNotFound(PathBuf),

    #[error("archive {} is corrupt: {reason}", path.display())]
    ArchiveCorrupt { path: PathBuf, reason: String },

    /// Filesystem failure unrelated to cryptography.
    #[error("failed to {op} {}: {source}", path.display())]
    FileSystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("encryption failed")]
    Encryption,

    #[error("OS random generator unavailable")]
    Random,

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn fs(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::FileSystem {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Error::ArchiveCorrupt {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Process exit code for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::KeyDerivation(_) | Error::SaltNotFound(_) | Error::SaltExists(_) => 2,
            Error::FileSystem { .. } => 3,
            Error::ArchiveNotFound(_) => 4,
            Error::ArchiveCorrupt { .. } => 5,
            Error::Authentication | Error::Expired { .. } => 6,
            Error::Cancelled => 130,
            Error::Encryption | Error::Random => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let codes = [
            Error::KeyDerivation("x".into()).exit_code(),
            Error::fs("read", "/x", io::Error::other("boom")).exit_code(),
            Error::ArchiveNotFound("/x".into()).exit_code(),
            Error::corrupt("/x", "bad").exit_code(),
            Error::Authentication.exit_code(),
        ];

        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn filesystem_error_names_the_path() {
        let err = Error::fs("read", "/data/a.txt", io::Error::other("denied"));
        let msg = err.to_string();
        assert!(msg.contains("/data/a.txt"));
        assert!(msg.contains("read"));
    }
}
