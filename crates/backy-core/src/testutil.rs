use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::{ChunkerConfig, EngineConfig, RetryConfig, WorkerConfig};
use crate::transport::RemoteStore;
use backy_types::content_id::ContentId;
use backy_types::error::{BackyError, Result};

/// In-memory remote store for tests. Thread-safe via Mutex; counts
/// existence checks and upload attempts, and can simulate a connection
/// that drops after a number of successful uploads.
pub struct MemoryRemote {
    chunks: Mutex<HashMap<ContentId, Vec<u8>>>,
    manifests: Mutex<HashMap<String, Vec<u8>>>,
    has_calls: AtomicUsize,
    put_calls: AtomicUsize,
    ok_puts: AtomicUsize,
    /// Once this many uploads have succeeded, every further `put_chunk`
    /// fails with a transient error until `heal()` is called.
    fail_puts_after: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::failing_after(usize::MAX)
    }

    pub fn failing_after(successful_puts: usize) -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
            manifests: Mutex::new(HashMap::new()),
            has_calls: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
            ok_puts: AtomicUsize::new(0),
            fail_puts_after: AtomicUsize::new(successful_puts),
        }
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.fail_puts_after.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn has_calls(&self) -> usize {
        self.has_calls.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.put_calls.store(0, Ordering::SeqCst);
        self.has_calls.store(0, Ordering::SeqCst);
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn chunk(&self, id: &ContentId) -> Option<Vec<u8>> {
        self.chunks.lock().unwrap().get(id).cloned()
    }

    pub fn manifest_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.manifests.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn manifest(&self, name: &str) -> Option<Vec<u8>> {
        self.manifests.lock().unwrap().get(name).cloned()
    }
}

impl RemoteStore for MemoryRemote {
    fn has_chunk(&self, id: &ContentId) -> Result<bool> {
        self.has_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.chunks.lock().unwrap().contains_key(id))
    }

    fn put_chunk(&self, id: &ContentId, data: &[u8]) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if self.ok_puts.load(Ordering::SeqCst) >= self.fail_puts_after.load(Ordering::SeqCst) {
            return Err(BackyError::Network("injected connection drop".into()));
        }
        self.chunks.lock().unwrap().insert(*id, data.to_vec());
        self.ok_puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn put_manifest(&self, name: &str, data: &[u8]) -> Result<()> {
        self.manifests
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

/// Deterministic pseudo-random bytes (xorshift) so chunk boundaries are
/// reproducible without fixture files.
pub fn gen_data(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Small chunk sizes so tests produce many chunks from small inputs.
pub fn test_chunker_config() -> ChunkerConfig {
    ChunkerConfig {
        min_size: 256,
        avg_size: 1024,
        max_size: 4096,
    }
}

/// Engine config tuned for tests: small chunks, fast retries, two workers.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        chunker: test_chunker_config(),
        retry: RetryConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        },
        workers: WorkerConfig { max_workers: 2 },
        stage_dir: None,
    }
}
