use std::path::Path;
use std::sync::atomic::AtomicBool;

use crate::job::{run_local_backup, JobProgressEvent, JobState};
use crate::manifest::Manifest;
use crate::store::{reassemble, LocalBlobStore};
use crate::testutil::{gen_data, test_engine_config};
use backy_types::content_id::Blake2Addressor;
use backy_types::error::BackyError;

fn states(events: &[JobProgressEvent]) -> Vec<JobState> {
    events
        .iter()
        .filter_map(|event| match event {
            JobProgressEvent::StateChanged { state } => Some(*state),
            _ => None,
        })
        .collect()
}

#[test]
fn local_job_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_engine_config();
    let data = gen_data(96 * 1024, 13);
    let source = dir.path().join("photos.raw");
    std::fs::write(&source, &data).unwrap();
    let dest = dir.path().join("backup");

    let mut events = Vec::new();
    let mut on_event = |event: JobProgressEvent| events.push(event);
    let outcome = run_local_backup(
        &source,
        &dest,
        &config,
        &Blake2Addressor,
        Some(&mut on_event),
        None,
    )
    .unwrap();

    assert_eq!(
        states(&events),
        vec![
            JobState::Chunking,
            JobState::Persisting,
            JobState::Verifying,
            JobState::Completed,
        ]
    );

    // The result names the manifest; reassembling from it restores the
    // source bytes exactly.
    let manifest_path = Path::new(&outcome.result);
    assert!(manifest_path.is_file());
    let manifest = Manifest::from_json(&std::fs::read(manifest_path).unwrap()).unwrap();
    assert_eq!(manifest.total_size, data.len() as u64);

    let store = LocalBlobStore::create(&dest).unwrap();
    let mut rebuilt = Vec::new();
    reassemble(&store, &manifest, &Blake2Addressor, &mut rebuilt).unwrap();
    assert_eq!(rebuilt, data);

    assert_eq!(outcome.stats.files, 1);
    assert_eq!(
        outcome.stats.chunks_processed,
        manifest.chunks.len() as u64
    );
}

#[test]
fn progress_counts_are_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_engine_config();
    let source = dir.path().join("data.bin");
    std::fs::write(&source, gen_data(64 * 1024, 3)).unwrap();

    let mut processed_seen = Vec::new();
    let mut on_event = |event: JobProgressEvent| {
        if let JobProgressEvent::ChunkCompleted { processed, total } = event {
            assert!(total.is_none(), "total unknown while streaming");
            processed_seen.push(processed);
        }
    };
    run_local_backup(
        &source,
        &dir.path().join("backup"),
        &config,
        &Blake2Addressor,
        Some(&mut on_event),
        None,
    )
    .unwrap();

    assert!(!processed_seen.is_empty());
    let expected: Vec<u64> = (1..=processed_seen.len() as u64).collect();
    assert_eq!(processed_seen, expected);
}

#[test]
fn zero_byte_file_completes_with_empty_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_engine_config();
    let source = dir.path().join("empty.dat");
    std::fs::write(&source, b"").unwrap();

    let mut events = Vec::new();
    let mut on_event = |event: JobProgressEvent| events.push(event);
    let outcome = run_local_backup(
        &source,
        &dir.path().join("backup"),
        &config,
        &Blake2Addressor,
        Some(&mut on_event),
        None,
    )
    .unwrap();

    let manifest = Manifest::from_json(&std::fs::read(&outcome.result).unwrap()).unwrap();
    assert_eq!(manifest.total_size, 0);
    assert!(manifest.chunks.is_empty());
    assert_eq!(outcome.stats.chunks_processed, 0);
    assert!(states(&events).contains(&JobState::Completed));
}

#[test]
fn directory_source_produces_one_manifest_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_engine_config();

    let source = dir.path().join("tree");
    std::fs::create_dir_all(source.join("nested")).unwrap();
    std::fs::write(source.join("a.txt"), gen_data(4 * 1024, 1)).unwrap();
    std::fs::write(source.join("b.txt"), gen_data(4 * 1024, 2)).unwrap();
    std::fs::write(source.join("nested/c.txt"), gen_data(4 * 1024, 3)).unwrap();

    let dest = dir.path().join("backup");
    let outcome = run_local_backup(&source, &dest, &config, &Blake2Addressor, None, None).unwrap();

    assert_eq!(outcome.stats.files, 3);
    let store = LocalBlobStore::create(&dest).unwrap();
    assert_eq!(outcome.result, store.manifest_dir().display().to_string());

    let manifest_count = std::fs::read_dir(store.manifest_dir()).unwrap().count();
    assert_eq!(manifest_count, 3);
}

#[test]
fn missing_source_fails_not_found_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_engine_config();
    let dest = dir.path().join("backup");

    let mut events = Vec::new();
    let mut on_event = |event: JobProgressEvent| events.push(event);
    let err = run_local_backup(
        &dir.path().join("does-not-exist"),
        &dest,
        &config,
        &Blake2Addressor,
        Some(&mut on_event),
        None,
    )
    .unwrap_err();

    assert!(matches!(err, BackyError::NotFound(_)));
    assert_eq!(states(&events), vec![JobState::Failed]);
    assert!(!dest.exists(), "destination must stay untouched");
}

#[test]
fn second_job_to_same_store_is_pure_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_engine_config();
    let source = dir.path().join("data.bin");
    std::fs::write(&source, gen_data(64 * 1024, 29)).unwrap();
    let dest = dir.path().join("backup");

    let first =
        run_local_backup(&source, &dest, &config, &Blake2Addressor, None, None).unwrap();
    assert!(first.stats.chunks_written > 0);

    let second =
        run_local_backup(&source, &dest, &config, &Blake2Addressor, None, None).unwrap();
    assert_eq!(second.stats.chunks_written, 0);
    assert_eq!(second.stats.chunks_deduplicated, first.stats.chunks_written);
}

#[test]
fn cancelled_job_fails_with_cancelled_cause() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_engine_config();
    let source = dir.path().join("data.bin");
    std::fs::write(&source, gen_data(32 * 1024, 8)).unwrap();

    let cancel = AtomicBool::new(true);
    let mut events = Vec::new();
    let mut on_event = |event: JobProgressEvent| events.push(event);
    let err = run_local_backup(
        &source,
        &dir.path().join("backup"),
        &config,
        &Blake2Addressor,
        Some(&mut on_event),
        Some(&cancel),
    )
    .unwrap_err();

    assert!(matches!(err, BackyError::Cancelled));
    assert_eq!(states(&events).last(), Some(&JobState::Failed));
}
