use std::path::Path;
use std::process::Command;

use tracing::info;

use backy_types::error::{BackyError, Result};

/// Client for the external deduplicating snapshot backend.
///
/// The backend performs its own chunking, dedup, and incremental logic over
/// a whole source tree; this client only invokes it, extracts its result,
/// and surfaces its errors verbatim. Backend failures are never retried
/// here.
pub struct SnapshotClient {
    program: String,
}

impl Default for SnapshotClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotClient {
    pub fn new() -> Self {
        Self {
            program: "kopia".to_string(),
        }
    }

    /// Use a different backend binary (configuration and tests).
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Request a new snapshot of `source`. Returns the snapshot id, or the
    /// backend's raw output when no id can be extracted.
    pub fn create(&self, source: &Path) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("snapshot")
            .arg("create")
            .arg(source)
            .arg("--json")
            .output()
            .map_err(|e| BackyError::Repository(format!("failed to run '{}': {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackyError::Repository(format!(
                "'{} snapshot create' failed with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = extract_snapshot_id(&stdout).unwrap_or_else(|| stdout.trim().to_string());
        info!(source = %source.display(), snapshot = %id, "snapshot backend run complete");
        Ok(id)
    }
}

/// Pull the snapshot id out of the backend's `--json` output.
fn extract_snapshot_id(stdout: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    value
        .get("id")
        .and_then(|id| id.as_str())
        .map(|id| id.to_string())
}
