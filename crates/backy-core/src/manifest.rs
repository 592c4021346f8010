use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use backy_types::content_id::ContentId;
use backy_types::error::{BackyError, Result};

pub const MANIFEST_VERSION: u32 = 1;

/// Reference to one stored chunk: its content id and byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: ContentId,
    pub length: u64,
}

/// Sealed record of everything needed to reconstruct one source file: the
/// ordered chunk list, the total size, and the source path.
///
/// Concatenating the chunk bodies in list order yields the source bytes
/// exactly. Immutable once sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub source_path: String,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    pub chunks: Vec<ChunkRef>,
}

impl Manifest {
    /// Re-check the reconstruction law: chunk lengths must sum to the
    /// recorded total size.
    pub fn verify(&self) -> Result<()> {
        let sum: u64 = self.chunks.iter().map(|c| c.length).sum();
        if sum != self.total_size {
            return Err(BackyError::Manifest(format!(
                "chunk lengths sum to {sum} but total size is {} for '{}'",
                self.total_size, self.source_path
            )));
        }
        Ok(())
    }

    /// Deterministic manifest file name for this manifest's source path.
    pub fn file_name(&self) -> String {
        file_name_for(&self.source_path)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Manifest> {
        let manifest: Manifest = serde_json::from_slice(data)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(BackyError::Manifest(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }
}

/// Manifest file name for a source path: the file stem plus a short digest
/// of the full path. The digest keeps same-named files from distinct
/// directories apart, while a re-run on the same source updates its
/// manifest in place instead of accumulating duplicates.
pub(crate) fn file_name_for(source_path: &str) -> String {
    let stem = std::path::Path::new(source_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let digest = ContentId::compute(source_path.as_bytes());
    format!("{stem}-{}.manifest.json", &digest.to_hex()[..8])
}

/// Accumulates chunk references in stream order.
///
/// Entries may arrive out of order (persist workers finish independently);
/// each is recorded at its stream position, and sealing refuses to proceed
/// while any position is unfilled. Sealing consumes the builder, so a sealed
/// manifest cannot be appended to.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    slots: Vec<Option<ChunkRef>>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the chunk at stream position `index`.
    pub fn record(&mut self, index: usize, id: ContentId, length: u64) {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(ChunkRef { id, length });
    }

    /// Number of positions recorded so far.
    pub fn recorded(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Seal into an immutable manifest, verifying completeness and the
    /// length-sum invariant.
    pub fn seal(self, total_size: u64, source_path: &str) -> Result<Manifest> {
        let mut chunks = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.into_iter().enumerate() {
            match slot {
                Some(chunk) => chunks.push(chunk),
                None => {
                    return Err(BackyError::Manifest(format!(
                        "cannot seal: no chunk recorded at position {index}"
                    )));
                }
            }
        }
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            source_path: source_path.to_string(),
            total_size,
            created_at: Utc::now(),
            chunks,
        };
        manifest.verify()?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ContentId {
        ContentId([byte; 32])
    }

    #[test]
    fn seal_in_order() {
        let mut builder = ManifestBuilder::new();
        builder.record(0, id(1), 100);
        builder.record(1, id(2), 50);
        let manifest = builder.seal(150, "/tmp/data.bin").unwrap();
        assert_eq!(manifest.total_size, 150);
        assert_eq!(manifest.chunks.len(), 2);
        assert_eq!(manifest.chunks[0].id, id(1));
        assert_eq!(manifest.chunks[1].id, id(2));
    }

    #[test]
    fn seal_accepts_out_of_order_recording() {
        let mut builder = ManifestBuilder::new();
        builder.record(2, id(3), 10);
        builder.record(0, id(1), 10);
        builder.record(1, id(2), 10);
        let manifest = builder.seal(30, "/tmp/data.bin").unwrap();
        let ids: Vec<ContentId> = manifest.chunks.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn seal_rejects_gap() {
        let mut builder = ManifestBuilder::new();
        builder.record(0, id(1), 10);
        builder.record(2, id(3), 10);
        let err = builder.seal(30, "/tmp/data.bin").unwrap_err();
        assert!(matches!(err, BackyError::Manifest(_)));
        assert!(err.to_string().contains("position 1"));
    }

    #[test]
    fn seal_rejects_length_sum_mismatch() {
        let mut builder = ManifestBuilder::new();
        builder.record(0, id(1), 10);
        let err = builder.seal(999, "/tmp/data.bin").unwrap_err();
        assert!(matches!(err, BackyError::Manifest(_)));
    }

    #[test]
    fn empty_source_seals_to_empty_manifest() {
        let manifest = ManifestBuilder::new().seal(0, "/tmp/empty").unwrap();
        assert_eq!(manifest.total_size, 0);
        assert!(manifest.chunks.is_empty());
        manifest.verify().unwrap();
    }

    #[test]
    fn json_roundtrip() {
        let mut builder = ManifestBuilder::new();
        builder.record(0, ContentId::compute(b"chunk"), 5);
        let manifest = builder.seal(5, "/home/user/notes.txt").unwrap();

        let json = manifest.to_json().unwrap();
        let back = Manifest::from_json(&json).unwrap();
        assert_eq!(back.source_path, manifest.source_path);
        assert_eq!(back.total_size, manifest.total_size);
        assert_eq!(back.chunks, manifest.chunks);
    }

    #[test]
    fn from_json_rejects_unknown_version() {
        let mut builder = ManifestBuilder::new();
        builder.record(0, id(1), 4);
        let manifest = builder.seal(4, "/tmp/x").unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        value["version"] = serde_json::json!(99);
        let err = Manifest::from_json(value.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, BackyError::Manifest(_)));
    }

    #[test]
    fn file_names_distinguish_same_stem_in_different_dirs() {
        let a = file_name_for("/home/alice/report.pdf");
        let b = file_name_for("/home/bob/report.pdf");
        assert_ne!(a, b);
        assert!(a.starts_with("report-"));
        assert!(a.ends_with(".manifest.json"));
    }

    #[test]
    fn file_name_is_stable_per_path() {
        assert_eq!(file_name_for("/data/db.sqlite"), file_name_for("/data/db.sqlite"));
    }
}
