//! ZIP container reading and writing.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::cancel::CancelFlag;
use crate::error::{Error, Result};

pub const ARCHIVE_EXT: &str = "zip";

const MAX_PREALLOC: u64 = 1 << 20;

/// Writer for one archive file.
///
/// Entries may be added from several worker threads; writes to the
/// container are serialized by the internal lock.
pub struct ArchiveWriter {
    path: PathBuf,
    zip: Mutex<ZipWriter<File>>,
}

impl ArchiveWriter {
    /// Creates `<dir>/<stem>.zip`, or `<dir>/<stem>_<n>.zip` with the first
    /// free `n` if that name is taken.
    ///
    /// The file is claimed with create-new semantics, so two runs can never
    /// end up writing the same archive.
    pub fn create_unique(dir: &Path, stem: &str) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::fs("create directory", dir, e))?;

        let mut n = 0u32;
        loop {
            let name = match n {
                0 => format!("{stem}.{ARCHIVE_EXT}"),
                _ => format!("{stem}_{n}.{ARCHIVE_EXT}"),
            };
            let path = dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    debug!(path = %path.display(), "created archive");
                    return Ok(Self {
                        path,
                        zip: Mutex::new(ZipWriter::new(file)),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(Error::fs("create archive", &path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one deflate-compressed entry.
    pub fn add_entry(&self, name: &str, data: &[u8]) -> Result<()> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut zip = self.zip.lock().unwrap_or_else(|e| e.into_inner());
        zip.start_file(name, options)
            .map_err(|e| Error::fs("write archive entry", &self.path, e.into()))?;
        zip.write_all(data)
            .map_err(|e| Error::fs("write archive entry", &self.path, e))?;
        Ok(())
    }

    /// Writes the central directory and closes the archive.
    pub fn finish(self) -> Result<PathBuf> {
        let zip = self.zip.into_inner().unwrap_or_else(|e| e.into_inner());
        let file = zip
            .finish()
            .map_err(|e| Error::fs("finish archive", &self.path, e.into()))?;
        file.sync_all()
            .map_err(|e| Error::fs("sync archive", &self.path, e))?;
        Ok(self.path)
    }
}

/// Read access to an existing archive.
pub struct ArchiveReader {
    path: PathBuf,
    zip: ZipArchive<File>,
}

impl ArchiveReader {
    /// Opens and parses `path`.
    ///
    /// # Errors
    ///
    /// [`Error::ArchiveNotFound`] if there is no such file,
    /// [`Error::ArchiveCorrupt`] if it is not a readable ZIP container.
    pub fn open(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::ArchiveNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(Error::fs("open archive", path, e)),
        };

        if file.metadata().map(|m| m.is_dir()).unwrap_or(false) {
            return Err(Error::corrupt(path, "is a directory"));
        }

        let zip = ZipArchive::new(file).map_err(|e| Error::corrupt(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            zip,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.zip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zip.len() == 0
    }

    /// Names of all file entries, in container order.
    pub fn entry_names(&self) -> Vec<String> {
        self.zip
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect()
    }

    /// Reads the content of one entry.
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut entry = self
            .zip
            .by_name(name)
            .map_err(|e| Error::corrupt(&self.path, format!("{name}: {e}")))?;

        let mut data = Vec::with_capacity(size_hint(entry.size()));
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::corrupt(&self.path, format!("{name}: {e}")))?;
        Ok(data)
    }

    /// Unpacks every file entry below `dest`, preserving relative paths.
    ///
    /// An entry whose data fails to read or decompress is reported as
    /// [`Extracted::Unreadable`] and the remaining entries are still
    /// extracted. Entry names that would escape `dest`, staging write
    /// failures and cancellation abort the extraction.
    pub fn extract_all(
        &mut self,
        dest: &Path,
        cancel: &CancelFlag,
    ) -> std::result::Result<Vec<Extracted>, ExtractError> {
        let mut outcomes = Vec::with_capacity(self.zip.len());

        for i in 0..self.zip.len() {
            cancel.check().map_err(ExtractError::run)?;

            let name = self
                .zip
                .name_for_index(i)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{i}"));

            let mut entry = match self.zip.by_index(i) {
                Ok(entry) => entry,
                Err(e) => {
                    outcomes.push(Extracted::Unreadable {
                        name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let relative = entry.enclosed_name().ok_or_else(|| {
                ExtractError::entry(
                    &name,
                    Error::corrupt(&self.path, format!("unsafe entry name {name:?}")),
                )
            })?;
            let target = dest.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|e| ExtractError::entry(&name, Error::fs("create directory", &target, e)))?;
                continue;
            }

            let mut data = Vec::with_capacity(size_hint(entry.size()));
            if let Err(e) = entry.read_to_end(&mut data) {
                outcomes.push(Extracted::Unreadable {
                    name,
                    reason: e.to_string(),
                });
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| ExtractError::entry(&name, Error::fs("create directory", parent, e)))?;
            }
            fs::write(&target, &data)
                .map_err(|e| ExtractError::entry(&name, Error::fs("write", &target, e)))?;

            debug!(entry = %name, "extracted");
            outcomes.push(Extracted::File(name));
        }

        Ok(outcomes)
    }
}

/// Result of extracting one archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    File(String),
    /// The entry's data is damaged; `reason` comes from the container.
    Unreadable { name: String, reason: String },
}

/// An extraction that had to stop, with the entry being handled if any.
#[derive(Debug)]
pub struct ExtractError {
    pub entry: Option<String>,
    pub error: Error,
}

impl ExtractError {
    fn run(error: Error) -> Self {
        Self { entry: None, error }
    }

    fn entry(name: &str, error: Error) -> Self {
        Self {
            entry: Some(name.to_string()),
            error,
        }
    }
}

/// Declared sizes are untrusted until the checksum is verified.
fn size_hint(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn written_entries_can_be_read_back() {
        let dir = tempdir().unwrap();

        let writer = ArchiveWriter::create_unique(dir.path(), "docs").unwrap();
        writer.add_entry("a.txt", b"hello").unwrap();
        writer.add_entry("b/c.txt", b"world").unwrap();
        let path = writer.finish().unwrap();

        assert_eq!(path, dir.path().join("docs.zip"));

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.entry_names(), vec!["a.txt", "b/c.txt"]);
        assert_eq!(reader.read_entry("b/c.txt").unwrap(), b"world");
    }

    #[test]
    fn taken_names_get_a_disambiguator() {
        let dir = tempdir().unwrap();

        let a = ArchiveWriter::create_unique(dir.path(), "docs").unwrap();
        let b = ArchiveWriter::create_unique(dir.path(), "docs").unwrap();
        let c = ArchiveWriter::create_unique(dir.path(), "docs").unwrap();

        assert_eq!(a.path(), dir.path().join("docs.zip"));
        assert_eq!(b.path(), dir.path().join("docs_1.zip"));
        assert_eq!(c.path(), dir.path().join("docs_2.zip"));
    }

    #[test]
    fn empty_archive_is_valid() {
        let dir = tempdir().unwrap();

        let path = ArchiveWriter::create_unique(dir.path(), "empty")
            .unwrap()
            .finish()
            .unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn missing_archive_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.zip");

        match ArchiveReader::open(&path) {
            Err(Error::ArchiveNotFound(p)) => assert_eq!(p, path),
            Err(other) => panic!("expected ArchiveNotFound, got: {other:?}"),
            Ok(_) => panic!("expected ArchiveNotFound, got an archive"),
        }
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.zip");
        fs::write(&path, b"definitely not a zip file").unwrap();

        assert!(matches!(
            ArchiveReader::open(&path),
            Err(Error::ArchiveCorrupt { .. })
        ));
    }

    #[test]
    fn extract_preserves_relative_paths() {
        let dir = tempdir().unwrap();
        let writer = ArchiveWriter::create_unique(dir.path(), "tree").unwrap();
        writer.add_entry("a.txt", b"hello").unwrap();
        writer.add_entry("b/c.txt", b"world").unwrap();
        let path = writer.finish().unwrap();

        let out = dir.path().join("out");
        let names = ArchiveReader::open(&path)
            .unwrap()
            .extract_all(&out, &CancelFlag::new())
            .unwrap();

        assert_eq!(
            names,
            vec![
                Extracted::File("a.txt".to_string()),
                Extracted::File("b/c.txt".to_string()),
            ]
        );
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(out.join("b").join("c.txt")).unwrap(), b"world");
    }

    #[test]
    fn extract_rejects_escaping_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evil.zip");

        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        zip.start_file("../evil.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"escape").unwrap();
        zip.finish().unwrap();

        let out = dir.path().join("out");
        let err = ArchiveReader::open(&path)
            .unwrap()
            .extract_all(&out, &CancelFlag::new())
            .unwrap_err();

        assert_eq!(err.entry.as_deref(), Some("../evil.txt"));
        assert!(matches!(err.error, Error::ArchiveCorrupt { .. }));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn damaged_entry_does_not_stop_extraction() {
        let dir = tempdir().unwrap();
        let writer = ArchiveWriter::create_unique(dir.path(), "damaged").unwrap();
        writer.add_entry("a.txt", &[b'a'; 256]).unwrap();
        writer.add_entry("b.txt", &[b'b'; 256]).unwrap();
        writer.add_entry("c.txt", &[b'c'; 256]).unwrap();
        let path = writer.finish().unwrap();

        // Flip a byte of b.txt's compressed data.
        let mut bytes = fs::read(&path).unwrap();
        let at = bytes.windows(5).position(|w| w == b"b.txt").unwrap() + 5 + 2;
        bytes[at] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let out = dir.path().join("out");
        let outcomes = ArchiveReader::open(&path)
            .unwrap()
            .extract_all(&out, &CancelFlag::new())
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0], Extracted::File("a.txt".to_string()));
        assert!(matches!(&outcomes[1], Extracted::Unreadable { name, .. } if name == "b.txt"));
        assert_eq!(outcomes[2], Extracted::File("c.txt".to_string()));
        assert_eq!(fs::read(out.join("c.txt")).unwrap(), [b'c'; 256]);
        assert!(!out.join("b.txt").exists());
    }

    #[test]
    fn declared_size_does_not_drive_allocation() {
        assert_eq!(size_hint(12), 12);
        assert_eq!(size_hint(u64::MAX), MAX_PREALLOC as usize);
    }
}
