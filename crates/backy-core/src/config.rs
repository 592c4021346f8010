use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Hard cap on `ChunkerConfig::max_size`. Any configured value above this is
/// clamped during validation, which bounds the largest chunk buffer one
/// worker can hold in flight.
pub const CHUNK_MAX_SIZE_HARD_CAP: u32 = 64 * 1024 * 1024; // 64 MiB

/// Smallest size bounds the content-defined chunker supports.
const CHUNK_MIN_SIZE_FLOOR: u32 = 64;
const CHUNK_AVG_SIZE_FLOOR: u32 = 256;
const CHUNK_MAX_SIZE_FLOOR: u32 = 1024;

fn default_min_size() -> u32 {
    2 * 1024 * 1024 // 2 MiB
}

fn default_avg_size() -> u32 {
    4 * 1024 * 1024 // 4 MiB
}

fn default_max_size() -> u32 {
    8 * 1024 * 1024 // 8 MiB
}

/// Chunk size bounds for content-defined chunking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default = "default_min_size")]
    pub min_size: u32,
    #[serde(default = "default_avg_size")]
    pub avg_size: u32,
    #[serde(default = "default_max_size")]
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            avg_size: default_avg_size(),
            max_size: default_max_size(),
        }
    }
}

impl ChunkerConfig {
    /// Clamp sizes into the supported range, keeping `min <= avg <= max`.
    pub fn validate(&mut self) {
        if self.max_size > CHUNK_MAX_SIZE_HARD_CAP {
            tracing::warn!(
                configured = self.max_size,
                cap = CHUNK_MAX_SIZE_HARD_CAP,
                "chunker.max_size exceeds hard cap, clamping"
            );
            self.max_size = CHUNK_MAX_SIZE_HARD_CAP;
        }
        self.min_size = self.min_size.clamp(CHUNK_MIN_SIZE_FLOOR, CHUNK_MAX_SIZE_HARD_CAP);
        self.avg_size = self
            .avg_size
            .clamp(self.min_size.max(CHUNK_AVG_SIZE_FLOOR), CHUNK_MAX_SIZE_HARD_CAP);
        self.max_size = self
            .max_size
            .clamp(self.avg_size.max(CHUNK_MAX_SIZE_FLOOR), CHUNK_MAX_SIZE_HARD_CAP);
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

/// Retry configuration for remote transfer operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Hard upper bound for persist workers per job.
const MAX_WORKERS: usize = 16;

/// Worker pool sizing for per-chunk digest + store work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker threads per job (0 = derive from available parallelism).
    #[serde(default)]
    pub max_workers: usize,
}

impl WorkerConfig {
    pub fn effective_workers(&self) -> usize {
        let requested = if self.max_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        } else {
            self.max_workers
        };
        requested.clamp(1, MAX_WORKERS)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Local staging directory for chunks of remote (SFTP) jobs.
    /// Default: platform cache dir + "backy/stage".
    #[serde(default)]
    pub stage_dir: Option<PathBuf>,
}
