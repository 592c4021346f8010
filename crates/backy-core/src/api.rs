use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::chunker;
use crate::config::EngineConfig;
use crate::job::{self, JobProgressEvent};
use crate::manifest::Manifest;
use crate::snapshot::SnapshotClient;
use crate::store::local::{LocalBlobStore, MANIFEST_DIR};
use crate::store::reassemble;
use crate::transport::{Credential, RemoteTarget, SftpTransporter};
use backy_types::content_id::{Blake2Addressor, ContentAddressor};
use backy_types::error::{BackyError, Result};

/// Back up a file or directory into a local content-addressed store.
#[derive(Debug, Clone)]
pub struct SaveBlobLocalRequest {
    pub source_path: String,
    pub dest_dir: String,
}

/// Back up a file or directory to a remote host over SFTP.
///
/// The password lives only as long as this request and the job it starts;
/// it is never logged or persisted.
pub struct SftpBackupRequest {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub source_path: String,
    pub remote_path: String,
}

/// Chunk a file and report the chunk count, persisting nothing.
#[derive(Debug, Clone)]
pub struct ChunkFileRequest {
    pub path: String,
}

/// Delegate a source tree to the external snapshot backend.
#[derive(Debug, Clone)]
pub struct SnapshotBackupRequest {
    pub source_path: String,
}

/// Reassemble a backed-up file from a local store.
#[derive(Debug, Clone)]
pub struct RestoreLocalRequest {
    pub manifest_path: String,
    pub output_path: String,
}

/// One completed backup found in a store's manifest directory.
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub manifest_path: PathBuf,
    pub source_path: String,
    pub total_size: u64,
    pub chunks: usize,
    pub created_at: DateTime<Utc>,
}

/// Typed command surface consumed by the UI shell.
///
/// One operation per command, each taking a validated request struct and
/// returning a result-or-error — never stringly-typed dispatch. Progress
/// arrives through the caller's callback as real per-chunk events.
pub struct Engine {
    config: EngineConfig,
    addressor: Box<dyn ContentAddressor>,
    snapshot: SnapshotClient,
}

impl Engine {
    pub fn new(mut config: EngineConfig) -> Self {
        config.chunker.validate();
        Self {
            config,
            addressor: Box::new(Blake2Addressor),
            snapshot: SnapshotClient::new(),
        }
    }

    /// Override the snapshot backend client (configuration and tests).
    pub fn with_snapshot_client(mut self, client: SnapshotClient) -> Self {
        self.snapshot = client;
        self
    }

    /// Swap the content-addressing algorithm.
    pub fn with_addressor(mut self, addressor: Box<dyn ContentAddressor>) -> Self {
        self.addressor = addressor;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a local-only backup job to completion; returns the manifest
    /// location.
    pub fn save_blob_local<'a>(
        &self,
        req: SaveBlobLocalRequest,
        progress: Option<&'a mut dyn FnMut(JobProgressEvent)>,
        cancel: Option<&'a AtomicBool>,
    ) -> Result<String> {
        let outcome = job::run_local_backup(
            Path::new(&req.source_path),
            Path::new(&req.dest_dir),
            &self.config,
            self.addressor.as_ref(),
            progress,
            cancel,
        )?;
        Ok(outcome.result)
    }

    /// Run an SFTP backup job to completion; returns the remote manifest
    /// location. The credential is dropped with the transporter when the
    /// job finishes, successfully or not.
    pub fn sftp_backup<'a>(
        &self,
        req: SftpBackupRequest,
        progress: Option<&'a mut dyn FnMut(JobProgressEvent)>,
        cancel: Option<&'a AtomicBool>,
    ) -> Result<String> {
        let source = PathBuf::from(&req.source_path);
        let transporter = SftpTransporter::new(RemoteTarget {
            host: req.host,
            port: req.port,
            username: req.username,
            credential: Credential::Password(req.password),
            remote_path: req.remote_path,
        });
        let stage = self.stage_dir()?;
        let outcome = job::run_sftp_backup(
            &source,
            &stage,
            &transporter,
            &self.config,
            self.addressor.as_ref(),
            progress,
            cancel,
        )?;
        Ok(outcome.result)
    }

    /// Chunk a file and report the resulting chunk count without persisting
    /// anything.
    pub fn chunk_file(&self, req: ChunkFileRequest) -> Result<usize> {
        chunker::count_chunks(Path::new(&req.path), &self.config.chunker)
    }

    /// Run a repository-snapshot job against the configured backend.
    pub fn snapshot_backup(
        &self,
        req: SnapshotBackupRequest,
        progress: Option<&mut dyn FnMut(JobProgressEvent)>,
    ) -> Result<String> {
        let outcome =
            job::run_snapshot_backup(Path::new(&req.source_path), &self.snapshot, progress)?;
        Ok(outcome.result)
    }

    /// Summarize the completed backups recorded in a store's manifest
    /// directory. A destination that is not a store yet yields an empty
    /// list.
    pub fn list_backups(&self, dest_dir: &Path) -> Result<Vec<BackupSummary>> {
        let dir = dest_dir.join(MANIFEST_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackyError::Storage(format!("list {}: {e}", dir.display()))),
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackyError::Storage(format!("list {}: {e}", dir.display())))?;
            let path = entry.path();
            if !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".manifest.json"))
            {
                continue;
            }
            let manifest = match fs::read(&path).map_err(BackyError::from).and_then(|data| {
                Manifest::from_json(&data)
            }) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(manifest = %path.display(), "skipping unreadable manifest: {e}");
                    continue;
                }
            };
            summaries.push(BackupSummary {
                manifest_path: path,
                source_path: manifest.source_path,
                total_size: manifest.total_size,
                chunks: manifest.chunks.len(),
                created_at: manifest.created_at,
            });
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Reassemble a backed-up file from its manifest, verifying every chunk
    /// digest along the way. Returns the output path.
    pub fn restore_local(&self, req: RestoreLocalRequest) -> Result<String> {
        let manifest_path = Path::new(&req.manifest_path);
        let data = fs::read(manifest_path)
            .map_err(|e| BackyError::NotFound(format!("{}: {e}", manifest_path.display())))?;
        let manifest = Manifest::from_json(&data)?;

        let root = manifest_path
            .parent()
            .and_then(|manifest_dir| manifest_dir.parent())
            .ok_or_else(|| {
                BackyError::Storage(format!(
                    "manifest {} is not inside a blob store",
                    manifest_path.display()
                ))
            })?;
        let store = LocalBlobStore::create(root)?;

        let output = Path::new(&req.output_path);
        let parent = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        reassemble(&store, &manifest, self.addressor.as_ref(), &mut tmp)?;
        tmp.flush()?;
        tmp.persist(output)
            .map_err(|e| BackyError::Storage(format!("rename {}: {}", output.display(), e.error)))?;
        Ok(output.display().to_string())
    }

    fn stage_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.config.stage_dir {
            return Ok(dir.clone());
        }
        let cache = dirs::cache_dir()
            .ok_or_else(|| BackyError::Storage("cannot determine cache directory".into()))?;
        Ok(cache.join("backy").join("stage"))
    }
}
