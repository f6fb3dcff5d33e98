//! Backup and restore runs.
//!
//! A backup walks the source tree, encrypts every file into a staging area
//! and packs the staged ciphertexts into one archive. A restore extracts an
//! archive into a staging area, decrypts each member and packs the
//! plaintexts into a second archive. The staging area is removed at the end
//! of every run, whatever the outcome.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::archive::{ArchiveReader, ArchiveWriter, ExtractError, Extracted};
use crate::cancel::CancelFlag;
use crate::crypto::FileCipher;
use crate::error::Error;
use crate::staging::StagingArea;
use crate::walk::{SourceFile, walk_files};

const EXTRACTED_DIR: &str = "extracted";
const DECRYPTED_DIR: &str = "decrypted";
const RESTORED_SUFFIX: &str = "restored";

/// Step of a run in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Staging,
    Archiving,
    Extracting,
    Decrypting,
    Rearchiving,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Staging => "staging",
            Stage::Archiving => "archiving",
            Stage::Extracting => "extracting",
            Stage::Decrypting => "decrypting",
            Stage::Rearchiving => "rearchiving",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// A run that failed, with the stage and, when known, the member involved.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed{}: {source}", member_suffix(.member))]
pub struct PipelineError {
    pub stage: Stage,
    pub member: Option<String>,
    #[source]
    pub source: Error,
}

fn member_suffix(member: &Option<String>) -> String {
    match member {
        Some(name) => format!(" on {name}"),
        None => String::new(),
    }
}

impl PipelineError {
    fn new(stage: Stage, source: Error) -> Self {
        Self {
            stage,
            member: None,
            source,
        }
    }

    fn on(stage: Stage, member: &str, source: Error) -> Self {
        Self {
            stage,
            member: Some(member.to_string()),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.source.exit_code()
    }
}

/// Why a file was left out of the produced archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Wrong password or a corrupted member.
    Authentication,
    /// The member's data is damaged inside the container.
    Corrupt { message: String },
    /// The file could not be read or written.
    Io { message: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Authentication => f.write_str("wrong password or corrupted data"),
            SkipReason::Corrupt { message } => write!(f, "corrupted archive member: {message}"),
            SkipReason::Io { message } => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub name: String,
    pub reason: SkipReason,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// The archive written by the run.
    pub archive: PathBuf,
    /// Entry names written to `archive`, in order.
    pub entries: Vec<String>,
    /// Files that were left out, with the reason.
    pub skipped: Vec<SkippedFile>,
}

impl RunReport {
    /// True when at least one file was skipped.
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

enum FileOutcome {
    Done,
    Skipped(SkipReason),
}

fn io_skip(err: Error) -> FileOutcome {
    FileOutcome::Skipped(SkipReason::Io {
        message: err.to_string(),
    })
}

/// Orchestrates backup and restore runs under one [`FileCipher`].
pub struct ArchivePipeline {
    cipher: FileCipher,
    cancel: CancelFlag,
    staging_root: Option<PathBuf>,
    pool: Option<rayon::ThreadPool>,
}

impl ArchivePipeline {
    pub fn new(cipher: FileCipher) -> Self {
        Self {
            cipher,
            cancel: CancelFlag::new(),
            staging_root: None,
            pool: None,
        }
    }

    /// Uses `cancel` to abort runs from elsewhere.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Creates staging areas below `root` instead of the output directory.
    pub fn with_staging_root(mut self, root: PathBuf) -> Self {
        self.staging_root = Some(root);
        self
    }

    /// Runs per-file work on a dedicated pool of `workers` threads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("backvault-worker-{i}"))
            .build()
        {
            Ok(pool) => self.pool = Some(pool),
            Err(e) => warn!(
                "could not build a pool of {workers} workers, using the global pool: {e}"
            ),
        }
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    fn parallel<R: Send>(&self, job: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(job),
            None => job(),
        }
    }

    fn staging_parent<'a>(&'a self, output_dir: &'a Path) -> &'a Path {
        self.staging_root.as_deref().unwrap_or(output_dir)
    }

    /// Encrypts every regular file below `source_dir` into a new archive in
    /// `backup_dir`, named `<source name>_<YYYYmmdd_HHMMSS>.zip`.
    ///
    /// Files that cannot be read are skipped and reported; failures to
    /// traverse the tree abort the run.
    pub fn backup(&self, source_dir: &Path, backup_dir: &Path) -> Result<RunReport, PipelineError> {
        let source_dir = fs::canonicalize(source_dir)
            .map_err(|e| PipelineError::new(Stage::Init, Error::fs("open source directory", source_dir, e)))?;
        if !source_dir.is_dir() {
            let err = io::Error::new(io::ErrorKind::NotADirectory, "not a directory");
            return Err(PipelineError::new(
                Stage::Init,
                Error::fs("open source directory", &source_dir, err),
            ));
        }

        let source_name = source_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup".to_string());
        let stem = format!("{source_name}_{}", Local::now().format("%Y%m%d_%H%M%S"));

        let staging = StagingArea::create(self.staging_parent(backup_dir))
            .map_err(|e| PipelineError::new(Stage::Init, e))?;

        info!(
            source = %source_dir.display(),
            staging = %staging.path().display(),
            "starting backup"
        );
        let result = self.backup_staged(&staging, &source_dir, backup_dir, &stem);
        finish_run(staging, result)
    }

    fn backup_staged(
        &self,
        staging: &StagingArea,
        source_dir: &Path,
        backup_dir: &Path,
        stem: &str,
    ) -> Result<RunReport, PipelineError> {
        let files = walk_files(source_dir).map_err(|e| PipelineError::new(Stage::Staging, e))?;
        self.backup_files(staging, &files, backup_dir, stem)
    }

    fn backup_files(
        &self,
        staging: &StagingArea,
        files: &[SourceFile],
        backup_dir: &Path,
        stem: &str,
    ) -> Result<RunReport, PipelineError> {
        info!(files = files.len(), "encrypting files");

        let outcomes = self.parallel(|| {
            files
                .par_iter()
                .map(|file| (file, self.stage_encrypted(staging, file)))
                .collect::<Vec<_>>()
        });

        let mut staged = Vec::with_capacity(files.len());
        let mut skipped = Vec::new();
        for (file, outcome) in outcomes {
            match outcome {
                Ok(FileOutcome::Done) => staged.push(file),
                Ok(FileOutcome::Skipped(reason)) => {
                    warn!(file = %file.name, %reason, "skipping file");
                    skipped.push(SkippedFile {
                        name: file.name.clone(),
                        reason,
                    });
                }
                Err(e) => return Err(PipelineError::on(Stage::Staging, &file.name, e)),
            }
        }

        let writer = ArchiveWriter::create_unique(backup_dir, stem)
            .map_err(|e| PipelineError::new(Stage::Archiving, e))?;
        info!(archive = %writer.path().display(), entries = staged.len(), "writing archive");

        let mut entries = Vec::with_capacity(staged.len());
        for file in staged {
            let added = self
                .cancel
                .check()
                .and_then(|()| staging.read(&file.relative))
                .and_then(|data| writer.add_entry(&file.name, &data));
            if let Err(e) = added {
                warn!(archive = %writer.path().display(), "leaving partial archive in place");
                return Err(PipelineError::on(Stage::Archiving, &file.name, e));
            }
            entries.push(file.name.clone());
        }

        let archive = writer
            .finish()
            .map_err(|e| PipelineError::new(Stage::Archiving, e))?;

        info!(archive = %archive.display(), entries = entries.len(), "backup complete");
        Ok(RunReport {
            archive,
            entries,
            skipped,
        })
    }

    fn stage_encrypted(&self, staging: &StagingArea, file: &SourceFile) -> Result<FileOutcome, Error> {
        self.cancel.check()?;

        let plaintext = match fs::read(&file.path) {
            Ok(data) => Zeroizing::new(data),
            Err(e) => return Ok(io_skip(Error::fs("read", &file.path, e))),
        };

        let blob = self.cipher.encrypt(&plaintext)?;

        match staging.write(&file.relative, &blob.to_bytes()) {
            Ok(_) => {
                debug!(file = %file.name, "encrypted");
                Ok(FileOutcome::Done)
            }
            Err(e) => Ok(io_skip(e)),
        }
    }

    /// Decrypts the members of `archive` into a new archive in
    /// `restore_dir`, named `<archive stem>_restored.zip`.
    ///
    /// Members that are damaged in the container or fail authentication are
    /// skipped and reported, so one bad member never blocks recovery of the
    /// others.
    pub fn restore(&self, archive: &Path, restore_dir: &Path) -> Result<RunReport, PipelineError> {
        let mut reader = ArchiveReader::open(archive).map_err(|e| PipelineError::new(Stage::Init, e))?;

        let archive_stem = archive
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup".to_string());
        let stem = format!("{archive_stem}_{RESTORED_SUFFIX}");

        let staging = StagingArea::create(self.staging_parent(restore_dir))
            .map_err(|e| PipelineError::new(Stage::Init, e))?;

        info!(
            archive = %archive.display(),
            members = reader.len(),
            staging = %staging.path().display(),
            "starting restore"
        );
        let result = self.restore_staged(&staging, &mut reader, restore_dir, &stem);
        finish_run(staging, result)
    }

    fn restore_staged(
        &self,
        staging: &StagingArea,
        reader: &mut ArchiveReader,
        restore_dir: &Path,
        stem: &str,
    ) -> Result<RunReport, PipelineError> {
        let extracted_root = staging.resolve(Path::new(EXTRACTED_DIR));
        let extracted = reader
            .extract_all(&extracted_root, &self.cancel)
            .map_err(extract_failure)?;

        let mut names = Vec::with_capacity(extracted.len());
        let mut skipped = Vec::new();
        for outcome in extracted {
            match outcome {
                Extracted::File(name) => names.push(name),
                Extracted::Unreadable { name, reason } => {
                    let reason = SkipReason::Corrupt { message: reason };
                    warn!(member = %name, %reason, "skipping member");
                    skipped.push(SkippedFile { name, reason });
                }
            }
        }

        info!(members = names.len(), "decrypting members");
        let outcomes = self.parallel(|| {
            names
                .par_iter()
                .map(|name| (name, self.stage_decrypted(staging, name)))
                .collect::<Vec<_>>()
        });

        let mut decrypted = Vec::with_capacity(names.len());
        for (name, outcome) in outcomes {
            match outcome {
                Ok(FileOutcome::Done) => decrypted.push(name),
                Ok(FileOutcome::Skipped(reason)) => {
                    warn!(member = %name, %reason, "skipping member");
                    skipped.push(SkippedFile {
                        name: name.clone(),
                        reason,
                    });
                }
                Err(e) => return Err(PipelineError::on(Stage::Decrypting, name, e)),
            }
        }

        let writer = ArchiveWriter::create_unique(restore_dir, stem)
            .map_err(|e| PipelineError::new(Stage::Rearchiving, e))?;

        let mut entries = Vec::with_capacity(decrypted.len());
        for name in decrypted {
            let relative = Path::new(DECRYPTED_DIR).join(member_path(name));
            let added = self
                .cancel
                .check()
                .and_then(|()| staging.read(&relative))
                .map(Zeroizing::new)
                .and_then(|data| writer.add_entry(name, &data));
            if let Err(e) = added {
                warn!(archive = %writer.path().display(), "leaving partial archive in place");
                return Err(PipelineError::on(Stage::Rearchiving, name, e));
            }
            entries.push(name.clone());
        }

        let archive = writer
            .finish()
            .map_err(|e| PipelineError::new(Stage::Rearchiving, e))?;

        if entries.is_empty() && !skipped.is_empty() {
            warn!(archive = %archive.display(), "no member could be decrypted");
        }
        info!(
            archive = %archive.display(),
            entries = entries.len(),
            skipped = skipped.len(),
            "restore complete"
        );
        Ok(RunReport {
            archive,
            entries,
            skipped,
        })
    }

    fn stage_decrypted(&self, staging: &StagingArea, name: &str) -> Result<FileOutcome, Error> {
        self.cancel.check()?;

        let relative = member_path(name);
        let ciphertext = match staging.read(&Path::new(EXTRACTED_DIR).join(&relative)) {
            Ok(data) => data,
            Err(e) => return Ok(io_skip(e)),
        };

        let plaintext = match self.cipher.decrypt_bytes(&ciphertext) {
            Ok(plaintext) => plaintext,
            Err(Error::Authentication) => {
                return Ok(FileOutcome::Skipped(SkipReason::Authentication));
            }
            Err(e) => return Err(e),
        };

        match staging.write(&Path::new(DECRYPTED_DIR).join(&relative), &plaintext) {
            Ok(_) => {
                debug!(member = %name, "decrypted");
                Ok(FileOutcome::Done)
            }
            Err(e) => Ok(io_skip(e)),
        }
    }
}

/// Relative filesystem path of a `/`-separated entry name.
fn member_path(name: &str) -> PathBuf {
    name.split('/').filter(|part| !part.is_empty()).collect()
}

fn extract_failure(err: ExtractError) -> PipelineError {
    match err.entry {
        Some(name) => PipelineError::on(Stage::Extracting, &name, err.error),
        None => PipelineError::new(Stage::Extracting, err.error),
    }
}

/// Removes the staging area and merges its outcome with the run's.
fn finish_run(
    staging: StagingArea,
    result: Result<RunReport, PipelineError>,
) -> Result<RunReport, PipelineError> {
    let cleanup = staging.close();
    match (result, cleanup) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(PipelineError::new(Stage::Cleanup, e)),
        (Ok(report), Ok(())) => Ok(report),
    }
}
