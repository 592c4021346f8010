pub(crate) mod pipeline;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ignore::WalkBuilder;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::manifest::Manifest;
use crate::snapshot::SnapshotClient;
use crate::store::local::LocalBlobStore;
use crate::transport::{with_retry, RemoteStore};
use backy_types::content_id::{ContentAddressor, ContentId};
use backy_types::error::{BackyError, Result};

/// Lifecycle of one backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Chunking,
    Persisting,
    Uploading,
    Verifying,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Legal transitions of the job state machine. `Failed` is reachable
    /// from every non-terminal state; terminal states never move.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Chunking) => true,
            (Chunking, Persisting) => true,
            (Persisting, Uploading) => true,
            (Persisting, Verifying) => true,
            (Uploading, Verifying) => true,
            (Verifying, Completed) => true,
            _ => false,
        }
    }
}

/// Progress notifications delivered while a job runs.
///
/// Callers only ever observe these snapshots; the job's mutable state is
/// owned by the orchestrator for the duration of the run.
#[derive(Debug, Clone)]
pub enum JobProgressEvent {
    StateChanged {
        state: JobState,
    },
    FileStarted {
        path: String,
    },
    /// Emitted after a chunk finishes its persist (and, for remote jobs,
    /// upload) step. `total` is reported once the chunk count is known.
    ChunkCompleted {
        processed: u64,
        total: Option<u64>,
    },
    FileCompleted {
        path: String,
        chunks: u64,
    },
}

/// Counters accumulated over one job.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobStats {
    pub files: u64,
    pub chunks_processed: u64,
    pub chunks_written: u64,
    pub chunks_deduplicated: u64,
    pub chunks_uploaded: u64,
    pub chunks_upload_skipped: u64,
    pub bytes_processed: u64,
}

/// Result of a completed job: the location to report plus counters.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub result: String,
    pub stats: JobStats,
}

/// Owns one job's mutable state and enforces the transition table.
pub(crate) struct JobDriver<'a> {
    state: JobState,
    pub(crate) stats: JobStats,
    progress: Option<&'a mut dyn FnMut(JobProgressEvent)>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> JobDriver<'a> {
    fn new(
        progress: Option<&'a mut dyn FnMut(JobProgressEvent)>,
        cancel: Option<&'a AtomicBool>,
    ) -> Self {
        Self {
            state: JobState::Pending,
            stats: JobStats::default(),
            progress,
            cancel,
        }
    }

    pub(crate) fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn cancel_flag(&self) -> Option<&'a AtomicBool> {
        self.cancel
    }

    pub(crate) fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal job transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
        self.emit(JobProgressEvent::StateChanged { state: next });
    }

    pub(crate) fn emit(&mut self, event: JobProgressEvent) {
        if let Some(callback) = self.progress.as_deref_mut() {
            callback(event);
        }
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(BackyError::Cancelled);
        }
        Ok(())
    }

    /// Count one chunk as fully processed and report progress.
    pub(crate) fn complete_chunk(&mut self, total: Option<u64>) {
        self.stats.chunks_processed += 1;
        let processed = self.stats.chunks_processed;
        self.emit(JobProgressEvent::ChunkCompleted { processed, total });
    }

    /// Transition to `Failed`, retaining the cause for the caller.
    fn fail(&mut self, err: BackyError) -> BackyError {
        if !self.state.is_terminal() {
            self.state = JobState::Failed;
            self.emit(JobProgressEvent::StateChanged {
                state: JobState::Failed,
            });
        }
        err
    }
}

/// Run a local-only backup job to completion.
pub fn run_local_backup<'a>(
    source: &Path,
    dest_dir: &Path,
    config: &EngineConfig,
    addressor: &dyn ContentAddressor,
    progress: Option<&'a mut dyn FnMut(JobProgressEvent)>,
    cancel: Option<&'a AtomicBool>,
) -> Result<JobOutcome> {
    run_backup(source, dest_dir, None, config, addressor, progress, cancel)
}

/// Run an SFTP backup job: chunks staged in a local store, then shipped to
/// `remote` with per-chunk existence checks so confirmed bodies are never
/// re-sent.
pub fn run_sftp_backup<'a>(
    source: &Path,
    stage_dir: &Path,
    remote: &dyn RemoteStore,
    config: &EngineConfig,
    addressor: &dyn ContentAddressor,
    progress: Option<&'a mut dyn FnMut(JobProgressEvent)>,
    cancel: Option<&'a AtomicBool>,
) -> Result<JobOutcome> {
    run_backup(
        source,
        stage_dir,
        Some(remote),
        config,
        addressor,
        progress,
        cancel,
    )
}

/// Run a repository-snapshot job by delegating to the external backend.
///
/// The backend chunks, dedups, and uploads internally; the job passes
/// through the intermediate states so callers observe a uniform lifecycle.
pub fn run_snapshot_backup(
    source: &Path,
    client: &SnapshotClient,
    progress: Option<&mut dyn FnMut(JobProgressEvent)>,
) -> Result<JobOutcome> {
    let mut driver = JobDriver::new(progress, None);
    let result = (|| {
        if !source.exists() {
            return Err(BackyError::NotFound(source.display().to_string()));
        }
        driver.advance(JobState::Chunking);
        driver.advance(JobState::Persisting);
        driver.advance(JobState::Uploading);
        let snapshot_id = client.create(source)?;
        driver.advance(JobState::Verifying);
        driver.advance(JobState::Completed);
        Ok(snapshot_id)
    })();

    match result {
        Ok(snapshot_id) => Ok(JobOutcome {
            result: snapshot_id,
            stats: driver.stats,
        }),
        Err(e) => Err(driver.fail(e)),
    }
}

fn run_backup<'a>(
    source: &Path,
    dest_dir: &Path,
    remote: Option<&dyn RemoteStore>,
    config: &EngineConfig,
    addressor: &dyn ContentAddressor,
    progress: Option<&'a mut dyn FnMut(JobProgressEvent)>,
    cancel: Option<&'a AtomicBool>,
) -> Result<JobOutcome> {
    let mut driver = JobDriver::new(progress, cancel);
    match run_backup_inner(source, dest_dir, remote, config, addressor, &mut driver) {
        Ok(outcome) => Ok(outcome),
        Err(e) => Err(driver.fail(e)),
    }
}

fn run_backup_inner(
    source: &Path,
    dest_dir: &Path,
    remote: Option<&dyn RemoteStore>,
    config: &EngineConfig,
    addressor: &dyn ContentAddressor,
    driver: &mut JobDriver<'_>,
) -> Result<JobOutcome> {
    // Source must exist before anything touches the destination.
    let files = collect_source_files(source)?;
    let store = LocalBlobStore::create(dest_dir)?;
    if let Some(remote) = remote {
        // Auth rejections are permanent and bail immediately; connection
        // failures fall under the transient retry policy.
        with_retry(&config.retry, "remote connect", || remote.prepare())?;
    }

    driver.advance(JobState::Chunking);

    // For local jobs a chunk is done once persisted; remote jobs count a
    // chunk only after its upload step.
    let count_on_persist = remote.is_none();

    let mut manifests = Vec::with_capacity(files.len());
    for file in &files {
        driver.check_cancelled()?;
        let display_path = file.to_string_lossy().into_owned();
        driver.emit(JobProgressEvent::FileStarted {
            path: display_path.clone(),
        });

        let (builder, total_size) =
            pipeline::chunk_and_persist(file, &store, addressor, config, driver, count_on_persist)?;
        let manifest = builder.seal(total_size, &display_path)?;
        driver.emit(JobProgressEvent::FileCompleted {
            path: display_path,
            chunks: manifest.chunks.len() as u64,
        });
        driver.stats.files += 1;
        manifests.push(manifest);
    }

    // Empty sources produce no chunks, so the pipeline never reached the
    // persisting state on its own.
    if driver.state() == JobState::Chunking {
        driver.advance(JobState::Persisting);
    }

    if let Some(remote) = remote {
        driver.advance(JobState::Uploading);
        upload_to_remote(&manifests, &store, remote, config, driver)?;
    }

    driver.advance(JobState::Verifying);
    for manifest in &manifests {
        manifest.verify()?;
        for chunk in &manifest.chunks {
            if !store.has(&chunk.id)? {
                return Err(BackyError::Storage(format!(
                    "verification failed: chunk {} of '{}' missing from store",
                    chunk.id, manifest.source_path
                )));
            }
        }
    }

    let mut locations = Vec::with_capacity(manifests.len());
    for manifest in &manifests {
        locations.push(store.finalize(manifest)?);
    }

    driver.advance(JobState::Completed);

    let result = match (remote, locations.as_slice()) {
        (Some(remote), [_single]) => remote.location(&manifests[0].file_name()),
        (Some(remote), _) => remote.location(""),
        (None, [single]) => single.display().to_string(),
        (None, _) => store.manifest_dir().display().to_string(),
    };

    info!(
        files = driver.stats.files,
        chunks = driver.stats.chunks_processed,
        written = driver.stats.chunks_written,
        deduplicated = driver.stats.chunks_deduplicated,
        "backup job completed"
    );

    Ok(JobOutcome {
        result,
        stats: driver.stats,
    })
}

/// Ship every chunk referenced by the manifests, skipping bodies the remote
/// already holds, then the manifests themselves.
fn upload_to_remote(
    manifests: &[Manifest],
    store: &LocalBlobStore,
    remote: &dyn RemoteStore,
    config: &EngineConfig,
    driver: &mut JobDriver<'_>,
) -> Result<()> {
    let total: u64 = manifests.iter().map(|m| m.chunks.len() as u64).sum();
    let mut confirmed: HashSet<ContentId> = HashSet::new();

    for manifest in manifests {
        for chunk in &manifest.chunks {
            driver.check_cancelled()?;
            if !confirmed.contains(&chunk.id) {
                let id = chunk.id;
                let exists =
                    with_retry(&config.retry, "remote chunk check", || remote.has_chunk(&id))?;
                if exists {
                    driver.stats.chunks_upload_skipped += 1;
                    debug!(chunk = %id, "remote dedup hit, skipping upload");
                } else {
                    let data = store.read(&id)?.ok_or_else(|| {
                        BackyError::Storage(format!(
                            "chunk {id} missing from local store during upload"
                        ))
                    })?;
                    with_retry(&config.retry, "chunk upload", || remote.put_chunk(&id, &data))?;
                    driver.stats.chunks_uploaded += 1;
                }
                confirmed.insert(id);
            }
            driver.complete_chunk(Some(total));
        }
    }

    for manifest in manifests {
        let name = manifest.file_name();
        let data = manifest.to_json()?;
        with_retry(&config.retry, "manifest upload", || {
            remote.put_manifest(&name, &data)
        })?;
    }

    Ok(())
}

/// Collect the regular files a job will back up: the source itself, or the
/// sorted regular files under a source directory.
fn collect_source_files(source: &Path) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(source)
        .map_err(|e| BackyError::NotFound(format!("{}: {e}", source.display())))?;
    if meta.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }
    if !meta.is_dir() {
        return Err(BackyError::NotFound(format!(
            "{}: not a regular file or directory",
            source.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkBuilder::new(source)
        .standard_filters(false)
        .follow_links(false)
        .build()
    {
        let entry = entry.map_err(|e| BackyError::NotFound(format!("{}: {e}", source.display())))?;
        if entry.file_type().is_some_and(|ft| ft.is_file()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
