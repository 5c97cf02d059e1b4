//! The per-node metadata store: a directory of well-known files that makes
//! every node, fork and chunk resumable across process restarts.
//!
//! File contents are opaque key/value writes as far as the scheduler is
//! concerned; state is derived purely from which files exist. Reads go
//! through a per-instance cache that the scheduling loop invalidates once
//! per iteration.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::engine::RuntimeError;

/// The fixed vocabulary of metadata files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataFile {
    /// The resolved argument record handed to a job.
    Args,
    /// The outputs a job produced.
    Outs,
    /// Written by a job on successful completion.
    Complete,
    /// Written by a job (or the runtime) on failure.
    Errors,
    /// A failed user-level assertion, also a failure marker.
    Assert,
    /// Touched periodically by running jobs; staleness feeds liveness checks.
    Heartbeat,
    /// The job manager's identifier for a submitted job.
    JobId,
    /// The job mode the pipestance was created under.
    JobMode,
    /// Serializes controllers for one pipestance directory.
    Lock,
    /// Start (and eventually end) timestamps.
    Timestamp,
    /// Versions of the runtime and pipeline source.
    Versions,
    /// Captured stdout of a job.
    Stdout,
    /// Captured stderr of a job.
    Stderr,
    /// The performance summary written at completion.
    Perf,
    /// The final state digest written at completion.
    FinalState,
    /// The archive of all metadata written by immortalize.
    MetadataArchive,
    /// The UI port advertised by the controlling process.
    UiPort,
    /// The pipestance UUID.
    UuidFile,
    /// Chunk argument records produced by a split.
    ChunkDefs,
    /// Per-chunk outputs merged by the join.
    ChunkOuts,
    /// A job's progress log; its presence marks the job as started.
    Log,
    /// The kill message recorded when the pipestance stops issuing jobs.
    KillMarker,
    /// The invocation record for the pipestance.
    Invocation,
    /// The cluster submission script generated for a job.
    JobScript,
}

impl MetadataFile {
    /// The on-disk file name.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Args => "_args",
            Self::Outs => "_outs",
            Self::Complete => "_complete",
            Self::Errors => "_errors",
            Self::Assert => "_assert",
            Self::Heartbeat => "_heartbeat",
            Self::JobId => "_jobid",
            Self::JobMode => "_jobmode",
            Self::Lock => "_lock",
            Self::Timestamp => "_timestamp",
            Self::Versions => "_versions",
            Self::Stdout => "_stdout",
            Self::Stderr => "_stderr",
            Self::Perf => "_perf",
            Self::FinalState => "_finalstate",
            Self::MetadataArchive => "_metadata.tar",
            Self::UiPort => "_uiport",
            Self::UuidFile => "_uuid",
            Self::ChunkDefs => "_stage_defs",
            Self::ChunkOuts => "_chunk_outs",
            Self::Log => "_log",
            Self::KillMarker => "_kill",
            Self::Invocation => "_invocation",
            Self::JobScript => "_jobscript",
        }
    }
}

/// The state a node, fork or chunk can be observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataState {
    /// Prerequisites are not yet complete.
    Waiting,
    /// Prerequisites are complete; a job has not been issued.
    Ready,
    /// A job has been submitted but has not begun.
    Queued,
    /// The job has begun and has not reached a terminal file.
    Running,
    /// The terminal success file exists.
    Complete,
    /// A failure marker exists.
    Failed,
    /// The node is disabled and will never run.
    DisabledState,
    /// A pipeline whose children are in mixed, non-terminal states.
    ForkWaiting,
}

impl MetadataState {
    /// Whether this state will never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::DisabledState)
    }

    /// Whether a node in this state counts as satisfied for its dependents.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, Self::Complete | Self::DisabledState)
    }

    /// The string written into state digests.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::DisabledState => "disabled",
            Self::ForkWaiting => "waiting (fork)",
        }
    }
}

/// The marker line written when a liveness probe concludes a job vanished.
pub const NOT_RUNNING_MARKER: &str = "is not running";

/// Markers that classify a failure as transient: the job died to the
/// machine, not to the pipeline, and a rerun is expected to succeed.
const TRANSIENT_MARKERS: &[&str] = &[
    "MemoryError",
    "OutOfMemoryError",
    "out of memory",
    "Out of memory",
    "oom-kill",
    "signal: killed",
];

/// If `message` carries a transient-failure marker, return the first line
/// that does.
#[must_use]
pub fn transient_marker_line(message: &str) -> Option<&str> {
    message
        .lines()
        .find(|line| TRANSIENT_MARKERS.iter().any(|marker| line.contains(marker)))
}

/// A handle to one metadata directory plus its read cache.
pub struct Metadata {
    /// Fully-qualified name of the owning node/fork/chunk, used for journal
    /// breadcrumbs.
    fq_name: String,
    /// The backing directory.
    path: PathBuf,
    /// The cross-process breadcrumb directory, when journaling is enabled.
    journal_path: Option<PathBuf>,
    /// Cached reads; `None` records a known-absent file.
    cache: RefCell<HashMap<MetadataFile, Option<Rc<str>>>>,
}

impl Metadata {
    /// Create a handle for the directory at `path`.
    #[must_use]
    pub fn new(fq_name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            fq_name: fq_name.into(),
            path,
            journal_path: None,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Enable journal breadcrumbs in `journal_path` for this handle.
    #[must_use]
    pub fn with_journal(mut self, journal_path: PathBuf) -> Self {
        self.journal_path = Some(journal_path);
        self
    }

    /// The backing directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The owning entity's fully-qualified name.
    #[must_use]
    pub fn fq_name(&self) -> &str {
        &self.fq_name
    }

    /// Create the backing directory.
    pub fn make_dirs(&self) -> Result<(), RuntimeError> {
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    /// The absolute path of one metadata file.
    #[must_use]
    pub fn file_path(&self, file: MetadataFile) -> PathBuf {
        self.path.join(file.file_name())
    }

    /// Whether `file` exists, consulting the read cache first.
    #[must_use]
    pub fn exists(&self, file: MetadataFile) -> bool {
        if let Some(cached) = self.cache.borrow().get(&file) {
            return cached.is_some();
        }
        self.file_path(file).exists()
    }

    /// Read `file` as a string, caching the result (including absence).
    #[must_use]
    pub fn read_raw(&self, file: MetadataFile) -> Option<Rc<str>> {
        if let Some(cached) = self.cache.borrow().get(&file) {
            return cached.clone();
        }
        let value = std::fs::read_to_string(self.file_path(file))
            .ok()
            .map(Rc::from);
        self.cache.borrow_mut().insert(file, value.clone());
        value
    }

    /// Read `file`, or fail with an io error naming the path.
    pub fn read_raw_required(&self, file: MetadataFile) -> Result<Rc<str>, RuntimeError> {
        self.read_raw(file).ok_or_else(|| {
            RuntimeError::MissingMetadata {
                file: self.file_path(file),
            }
        })
    }

    /// Read `file` as JSON.
    pub fn read_json<T: DeserializeOwned>(&self, file: MetadataFile) -> Result<T, RuntimeError> {
        let raw = self.read_raw_required(file)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write `value` into `file` and drop a journal breadcrumb.
    ///
    /// Plain writes are not crash-atomic; callers that need atomicity use
    /// [`Metadata::write_time`] or wrap the write in the finalize critical
    /// section.
    pub fn write_raw(&self, file: MetadataFile, value: &str) -> Result<(), RuntimeError> {
        std::fs::write(self.file_path(file), value)?;
        self.cache.borrow_mut().insert(file, Some(Rc::from(value)));
        self.update_journal(file);
        Ok(())
    }

    /// Serialize `value` as pretty JSON into `file`.
    pub fn write_json<T: Serialize>(&self, file: MetadataFile, value: &T) -> Result<(), RuntimeError> {
        self.write_raw(file, &serde_json::to_string_pretty(value)?)
    }

    /// Atomically write the current timestamp into `file`.
    ///
    /// The content lands in a temporary file first and is renamed into
    /// place, so a crash can never leave a truncated marker behind.
    pub fn write_time(&self, file: MetadataFile) -> Result<(), RuntimeError> {
        let value = timestamp();
        let tmp = self.path.join(format!("{}.tmp", file.file_name()));
        std::fs::write(&tmp, &value)?;
        std::fs::rename(&tmp, self.file_path(file))?;
        self.cache
            .borrow_mut()
            .insert(file, Some(Rc::from(value.as_str())));
        self.update_journal(file);
        Ok(())
    }

    /// Remove `file`, ignoring absence.
    pub fn remove(&self, file: MetadataFile) -> Result<(), RuntimeError> {
        match std::fs::remove_file(self.file_path(file)) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        self.cache.borrow_mut().insert(file, None);
        Ok(())
    }

    /// Forget every cached read so the next access hits disk.
    pub fn clear_read_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    /// Every metadata file currently in the directory.
    #[must_use]
    pub fn glob(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.path) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with('_'))
            })
            .collect();
        files.sort();
        files
    }

    /// Every symlink in the directory.
    #[must_use]
    pub fn symlinks(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.path) else {
            return Vec::new();
        };
        let mut links: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_symlink())
            .collect();
        links.sort();
        links
    }

    /// Derive the observed state from which files exist.
    #[must_use]
    pub fn get_state(&self) -> Option<MetadataState> {
        if self.exists(MetadataFile::Errors) || self.exists(MetadataFile::Assert) {
            Some(MetadataState::Failed)
        } else if self.exists(MetadataFile::Complete) {
            Some(MetadataState::Complete)
        } else if self.exists(MetadataFile::Log) || self.exists(MetadataFile::Heartbeat) {
            Some(MetadataState::Running)
        } else if self.exists(MetadataFile::JobId) {
            Some(MetadataState::Queued)
        } else {
            None
        }
    }

    /// The heartbeat file's mtime, if a heartbeat was ever written.
    #[must_use]
    pub fn heartbeat_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(self.file_path(MetadataFile::Heartbeat))
            .and_then(|meta| meta.modified())
            .ok()
    }

    /// Record that the liveness probe found no trace of `job_id`.
    ///
    /// Writing the failure marker (rather than mutating node state) keeps
    /// the probe task decoupled from the scheduler; the next loop iteration
    /// observes the marker like any other job failure.
    pub fn fail_not_running(&self, job_id: &str) {
        if self.exists(MetadataFile::Errors) || self.exists(MetadataFile::Complete) {
            return;
        }
        let message = format!(
            "job {job_id} {NOT_RUNNING_MARKER}: the job manager queue and the local process table have no record of it"
        );
        if let Err(error) = self.write_raw(MetadataFile::Errors, &message) {
            log::error!("{}: failed to write not-running marker: {error}", self.fq_name);
        }
    }

    /// Drop a breadcrumb naming this write into the journal directory.
    fn update_journal(&self, file: MetadataFile) {
        if let Some(journal) = &self.journal_path {
            let crumb = journal.join(format!("{}.{}", self.fq_name, file.file_name()));
            if let Err(error) = std::fs::write(&crumb, timestamp()) {
                log::debug!("journal write failed for {}: {error}", crumb.display());
            }
        }
    }
}

/// The human-readable timestamp format used across metadata files.
#[must_use]
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
