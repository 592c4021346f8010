use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::manifest::Manifest;
use backy_types::content_id::{ContentAddressor, ContentId};
use backy_types::error::{BackyError, Result};

/// Subdirectory holding chunk bodies, sharded by the id's first byte.
const CHUNK_DIR: &str = "chunks";

/// Subdirectory holding sealed manifests.
pub(crate) const MANIFEST_DIR: &str = "manifests";

/// Content-addressed chunk store rooted at a destination directory.
///
/// At most one physical copy exists per content id. Writes are staged to a
/// temp file in the target directory and renamed into place, so a crash
/// mid-write can leave an orphaned temp file but never a partial body under
/// a valid chunk name. Entries are never deleted.
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open a store at `root`, creating the layout if needed. Fails with
    /// `Storage` when the destination cannot be created or written.
    pub fn create(root: &Path) -> Result<Self> {
        for sub in [CHUNK_DIR, MANIFEST_DIR] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| storage_err("create", &dir, &e))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join(MANIFEST_DIR)
    }

    fn chunk_path(&self, id: &ContentId) -> PathBuf {
        self.root
            .join(CHUNK_DIR)
            .join(id.shard_prefix())
            .join(id.to_hex())
    }

    /// Whether a chunk with this id is already stored.
    pub fn has(&self, id: &ContentId) -> Result<bool> {
        let path = self.chunk_path(id);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_err("stat", &path, &e)),
        }
    }

    /// Store a chunk body under its content id.
    ///
    /// Returns `false` without writing when the id is already present (dedup
    /// hit). Concurrent writers may race here; the atomic rename makes the
    /// race harmless since both hold identical bytes.
    pub fn put(&self, id: &ContentId, data: &[u8]) -> Result<bool> {
        if self.has(id)? {
            debug!(chunk = %id, "dedup hit, skipping write");
            return Ok(false);
        }
        let path = self.chunk_path(id);
        let dir = self.root.join(CHUNK_DIR).join(id.shard_prefix());
        fs::create_dir_all(&dir).map_err(|e| storage_err("mkdir", &dir, &e))?;
        atomic_write(&dir, &path, data)?;
        Ok(true)
    }

    /// Read a chunk body back, or `None` if the id is not stored.
    pub fn read(&self, id: &ContentId) -> Result<Option<Vec<u8>>> {
        let path = self.chunk_path(id);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("read", &path, &e)),
        }
    }

    /// Write a sealed manifest beside the chunk set and return its path,
    /// which identifies the completed backup.
    pub fn finalize(&self, manifest: &Manifest) -> Result<PathBuf> {
        manifest.verify()?;
        let dir = self.manifest_dir();
        let path = dir.join(manifest.file_name());
        atomic_write(&dir, &path, &manifest.to_json()?)?;
        debug!(manifest = %path.display(), chunks = manifest.chunks.len(), "manifest sealed");
        Ok(path)
    }
}

/// Reconstruct a backed-up file by streaming its chunks in manifest order.
///
/// Each body is re-hashed and checked against its recorded id and length, so
/// a corrupted store entry fails loudly instead of producing wrong bytes.
/// Returns the number of bytes written.
pub fn reassemble(
    store: &LocalBlobStore,
    manifest: &Manifest,
    addressor: &dyn ContentAddressor,
    mut out: impl Write,
) -> Result<u64> {
    manifest.verify()?;
    let mut written = 0u64;
    for (index, chunk) in manifest.chunks.iter().enumerate() {
        let data = store.read(&chunk.id)?.ok_or_else(|| {
            BackyError::Manifest(format!(
                "chunk {} (position {index}) missing from store",
                chunk.id
            ))
        })?;
        if data.len() as u64 != chunk.length || addressor.digest(&data) != chunk.id {
            return Err(BackyError::Manifest(format!(
                "chunk {} (position {index}) does not match its recorded id",
                chunk.id
            )));
        }
        out.write_all(&data)?;
        written += chunk.length;
    }
    Ok(written)
}

/// Write `data` to a temp file in `dir`, then atomically rename onto `path`.
/// On failure the temp file is discarded; the final name never holds a
/// partial body.
fn atomic_write(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| storage_err("stage", dir, &e))?;
    tmp.write_all(data).map_err(|e| storage_err("write", path, &e))?;
    tmp.persist(path)
        .map_err(|e| storage_err("rename", path, &e.error))?;
    Ok(())
}

fn storage_err(op: &str, path: &Path, e: &std::io::Error) -> BackyError {
    BackyError::Storage(format!("{op} {}: {e}", path.display()))
}
