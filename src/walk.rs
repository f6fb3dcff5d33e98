//! Recursive source tree traversal.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// A regular file found below a root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Archive entry name: the relative path joined with `/`.
    pub name: String,
    /// Path relative to the root.
    pub relative: PathBuf,
    /// Full path on disk.
    pub path: PathBuf,
}

/// Lists every regular file below `root`, sorted by entry name.
///
/// Symlinks are not followed. Any failure to read a directory aborts the
/// walk.
pub fn walk_files(root: &Path) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    walk_inner(root, root, &mut files)?;
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn walk_inner(base: &Path, current: &Path, files: &mut Vec<SourceFile>) -> Result<()> {
    let entries = fs::read_dir(current).map_err(|e| Error::fs("read directory", current, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::fs("read directory", current, e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| Error::fs("stat", &path, e))?;

        if file_type.is_dir() {
            walk_inner(base, &path, files)?;
        } else if file_type.is_file() {
            let relative = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
            files.push(SourceFile {
                name: entry_name(&relative),
                relative,
                path,
            });
        } else {
            debug!(path = %path.display(), "skipping non-regular file");
        }
    }
    Ok(())
}

/// Archive entry name for a relative path.
pub fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
