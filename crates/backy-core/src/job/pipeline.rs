use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::chunker::{self, Chunk};
use crate::config::EngineConfig;
use crate::manifest::ManifestBuilder;
use crate::store::local::LocalBlobStore;
use backy_types::content_id::{ContentAddressor, ContentId};
use backy_types::error::{BackyError, Result};

use super::{JobDriver, JobState};

/// Result from a persist worker.
struct StoredChunk {
    id: ContentId,
    length: u64,
    /// Whether a new body was written (`false` on a dedup hit).
    stored: bool,
}

/// Message on the pipeline's result channel.
enum PipelineMsg {
    /// `(stream position, persist result)` from a worker. Errors carry a
    /// position too, so earlier successes are retired first.
    Stored(usize, Result<StoredChunk>),
    /// Chunker error from the producer — fail-fast, no reordering needed.
    ChunkerErr(BackyError),
}

/// Chunk one file and persist every chunk, pipelined:
/// sequential chunker → bounded work channel → N digest+store workers →
/// sequence-ordered consumer retiring entries into the manifest builder.
///
/// Storage order is unconstrained (dedup makes chunk storage commutative);
/// the builder records by stream position so the manifest keeps original
/// order regardless of completion order. Memory stays bounded by the
/// channel capacities times the maximum chunk size.
pub(super) fn chunk_and_persist(
    path: &Path,
    store: &LocalBlobStore,
    addressor: &dyn ContentAddressor,
    config: &EngineConfig,
    driver: &mut JobDriver<'_>,
    count_on_persist: bool,
) -> Result<(ManifestBuilder, u64)> {
    let file =
        File::open(path).map_err(|e| BackyError::NotFound(format!("{}: {e}", path.display())))?;

    let num_workers = config.workers.effective_workers();
    let work_cap = num_workers * 2;
    let result_cap = num_workers * 2;

    let cancel = driver.cancel_flag();
    let chunker_config = config.chunker.clone();

    let mut builder = ManifestBuilder::new();
    let mut total_size = 0u64;

    std::thread::scope(|s| -> Result<()> {
        let (work_tx, work_rx) = crossbeam_channel::bounded::<(usize, Chunk)>(work_cap);
        let (result_tx, result_rx) = crossbeam_channel::bounded::<PipelineMsg>(result_cap);

        // Producer: sequential content-defined chunking. The rolling hash
        // has positional dependency, so this stage cannot parallelize.
        let producer_tx = result_tx.clone();
        s.spawn(move || {
            let mut seq_idx = 0usize;
            for chunk_result in chunker::chunk_stream(file, &chunker_config) {
                if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                    // Stop at a chunk boundary; the consumer notices the
                    // flag once in-flight work has drained.
                    return;
                }
                match chunk_result {
                    Ok(chunk) => {
                        if work_tx.send((seq_idx, chunk)).is_err() {
                            return; // workers gone, consumer already bailed
                        }
                        seq_idx += 1;
                    }
                    Err(e) => {
                        let _ = producer_tx.send(PipelineMsg::ChunkerErr(e));
                        return;
                    }
                }
            }
        });

        // Workers: digest + persist. Completion order is unconstrained.
        for _ in 0..num_workers {
            let rx = work_rx.clone();
            let tx = result_tx.clone();
            s.spawn(move || {
                for (idx, chunk) in rx {
                    let result = persist_chunk(store, addressor, chunk);
                    if tx.send(PipelineMsg::Stored(idx, result)).is_err() {
                        return; // consumer gone
                    }
                }
            });
        }
        // Drop originals — channels close once all clones drop.
        drop(work_rx);
        drop(result_tx);

        // Consumer: retire results in stream order into the manifest.
        let mut next_expected = 0usize;
        let mut pending: BTreeMap<usize, Result<StoredChunk>> = BTreeMap::new();
        for msg in &result_rx {
            match msg {
                PipelineMsg::ChunkerErr(e) => return Err(e),
                PipelineMsg::Stored(idx, result) => {
                    pending.insert(idx, result);
                }
            }

            while let Some(result) = pending.remove(&next_expected) {
                let stored = result?;
                builder.record(next_expected, stored.id, stored.length);
                total_size += stored.length;
                if stored.stored {
                    driver.stats.chunks_written += 1;
                } else {
                    driver.stats.chunks_deduplicated += 1;
                }
                driver.stats.bytes_processed += stored.length;
                if driver.state() == JobState::Chunking {
                    driver.advance(JobState::Persisting);
                }
                if count_on_persist {
                    driver.complete_chunk(None);
                }
                next_expected += 1;
            }
        }

        // The producer may have stopped at a cancellation boundary without
        // the consumer ever seeing an error. Catch that here.
        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(BackyError::Cancelled);
        }

        Ok(())
    })?;

    Ok((builder, total_size))
}

fn persist_chunk(
    store: &LocalBlobStore,
    addressor: &dyn ContentAddressor,
    chunk: Chunk,
) -> Result<StoredChunk> {
    let id = addressor.digest(&chunk.data);
    let stored = store.put(&id, &chunk.data)?;
    Ok(StoredChunk {
        id,
        length: chunk.len(),
        stored,
    })
}
