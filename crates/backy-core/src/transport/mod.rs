pub mod sftp;

pub use sftp::SftpTransporter;

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use backy_types::content_id::ContentId;
use backy_types::error::Result;

use crate::config::RetryConfig;

/// Tokio runtime used by the async SSH stack to bridge into synchronous
/// call sites. Created lazily on first use.
pub(crate) static ASYNC_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    let worker_threads = std::thread::available_parallelism()
        .map(|n| n.get().clamp(2, 4))
        .unwrap_or(2);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .expect("failed to create tokio runtime for blocking layer")
});

/// Credential for one remote session. Held in memory only for the duration
/// of a job; never serialized, never logged.
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
        }
    }
}

/// Remote endpoint for one transfer. Lifetime scoped to a single job.
#[derive(Debug)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    /// Base directory on the remote under which `chunks/` and `manifests/`
    /// are laid out.
    pub remote_path: String,
}

/// A destination that stores chunk bodies and manifests under
/// content-addressed keys.
///
/// The orchestrator only sees this seam; the SFTP transporter and the
/// in-memory test double both implement it. `has_chunk` before `put_chunk`
/// is what extends dedup across the network: confirmed chunks are never
/// re-sent.
pub trait RemoteStore: Send + Sync {
    /// Establish the session eagerly so auth and connectivity failures
    /// surface before any transfer work starts.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the remote already holds this chunk.
    fn has_chunk(&self, id: &ContentId) -> Result<bool>;

    /// Upload one chunk body under its content-addressed name.
    fn put_chunk(&self, id: &ContentId, data: &[u8]) -> Result<()>;

    /// Upload a sealed manifest under `manifests/<name>`.
    fn put_manifest(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Human-readable location of an uploaded manifest, for job results.
    fn location(&self, name: &str) -> String {
        format!("manifests/{name}")
    }
}

/// Retry `f` on transient errors with bounded exponential backoff + jitter.
///
/// Permanent errors (auth, storage, not-found) bail immediately; once
/// `max_retries` retries are exhausted the last transport error surfaces.
pub fn with_retry<T>(
    config: &RetryConfig,
    op_name: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let base = delay_ms.max(1);
            let jitter = rand::random::<u64>() % base;
            std::thread::sleep(Duration::from_millis(base + jitter));
            delay_ms = base.saturating_mul(2).min(config.retry_max_delay_ms.max(1));
        }

        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("retry loop always returns before exhausting attempts")
}
