//! End-to-end vacuum scenarios over local and remote backends.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use volstore_core::{CoreError, NeedleId, StoreConfig, VacuumCoordinator, VacuumPhase, VolumeId};
use volstore_testkit::{needle_data, populate_with_garbage, verify_population, TestStore};

const VID: VolumeId = VolumeId::new(1);

/// 1000-byte payloads make 1024-byte records.
const DATA_LEN: usize = 1000;
const RECORD_LEN: u64 = 1024;

fn read_file(store: &TestStore, name: &str) -> Vec<u8> {
    std::fs::read(store.file_path(name).unwrap()).unwrap()
}

fn file_exists(store: &TestStore, name: &str) -> bool {
    store.file_path(name).unwrap().exists()
}

#[test]
fn vacuum_reclaims_deleted_space() {
    let store = TestStore::disk();
    let volume = store.create_volume(VID).unwrap();
    let population = populate_with_garbage(&volume, 100, DATA_LEN, 0.4).unwrap();
    let vacuum = VacuumCoordinator::new(Arc::clone(&store.store));

    let ratio = vacuum.check(VID).unwrap();
    assert!((ratio - 0.4).abs() < 0.02, "ratio was {ratio}");

    vacuum.compact(VID, 0).unwrap().run().unwrap();
    let outcome = vacuum.commit(VID).unwrap();
    assert!(!outcome.is_read_only);
    assert_eq!(outcome.volume_size, 16 + 60 * RECORD_LEN);

    vacuum.cleanup(VID).unwrap();
    assert!(!file_exists(&store, "1.g0.dat"));
    assert!(file_exists(&store, "1.g1.dat"));
    assert!(file_exists(&store, "1.g1.cmt"));
    assert_eq!(volume.garbage_ratio(), 0.0);
    verify_population(&volume, &population).unwrap();
}

#[test]
fn vacuum_crash_during_compaction_keeps_old_generation() {
    let store = TestStore::disk();
    let volume = store.create_volume(VID).unwrap();
    let population = populate_with_garbage(&volume, 100, DATA_LEN, 0.4).unwrap();
    volume.sync().unwrap();
    let before = read_file(&store, "1.g0.dat");

    store.backend.only_paths(".g1.");
    store.backend.crash_after(5000);

    let vacuum = VacuumCoordinator::new(Arc::clone(&store.store));
    let results: Vec<_> = vacuum.compact(VID, 0).unwrap().collect();
    assert!(matches!(results.last(), Some(Err(CoreError::Storage(_)))));
    assert!(store.backend.has_crashed());

    assert_eq!(volume.phase(), VacuumPhase::Aborted);
    assert!(!file_exists(&store, "1.g1.dat"));
    assert_eq!(read_file(&store, "1.g0.dat"), before);
    verify_population(&volume, &population).unwrap();

    // The volume takes writes again and a later vacuum succeeds.
    store.backend.reset();
    volume
        .write_needle(NeedleId::new(500), b"after crash")
        .unwrap();
    vacuum.compact(VID, 0).unwrap().run().unwrap();
    vacuum.commit(VID).unwrap();
    verify_population(&volume, &population).unwrap();
}

#[test]
fn vacuum_commit_marker_failure_is_retryable() {
    let store = TestStore::disk();
    let volume = store.create_volume(VID).unwrap();
    let population = populate_with_garbage(&volume, 40, DATA_LEN, 0.5).unwrap();
    let vacuum = VacuumCoordinator::new(Arc::clone(&store.store));
    vacuum.compact(VID, 0).unwrap().run().unwrap();

    store.backend.only_paths(".cmt");
    store.backend.set_fail_on_open(true);
    assert!(vacuum.commit(VID).is_err());

    assert_eq!(volume.phase(), VacuumPhase::Compacted);
    assert_eq!(volume.generation().as_u64(), 0);
    assert!(!volume.is_read_only());
    assert!(!file_exists(&store, "1.g1.cmt"));
    verify_population(&volume, &population).unwrap();

    store.backend.reset();
    vacuum.commit(VID).unwrap();
    assert_eq!(volume.generation().as_u64(), 1);
    verify_population(&volume, &population).unwrap();
}

#[test]
fn vacuum_restart_discards_unfinished_compaction() {
    let mut store = TestStore::disk_with(StoreConfig::default().compaction_batch_bytes(4096));
    let volume = store.create_volume(VID).unwrap();
    let population = populate_with_garbage(&volume, 50, DATA_LEN, 0.4).unwrap();
    volume.sync().unwrap();

    // The process dies mid-compaction: nothing gets to clean up.
    let vacuum = VacuumCoordinator::new(Arc::clone(&store.store));
    let mut stream = vacuum.compact(VID, 0).unwrap();
    stream.next().unwrap().unwrap();
    std::mem::forget(stream);
    assert!(file_exists(&store, "1.g1.dat"));

    let restarted = store.restart().unwrap();
    assert!(!file_exists(&store, "1.g1.dat"));
    let volume = restarted.volume(VID).unwrap();
    assert_eq!(volume.generation().as_u64(), 0);
    assert_eq!(volume.phase(), VacuumPhase::Idle);
    verify_population(&volume, &population).unwrap();
}

#[test]
fn vacuum_restart_keeps_finished_compaction() {
    let mut store = TestStore::disk();
    let volume = store.create_volume(VID).unwrap();
    let population = populate_with_garbage(&volume, 30, DATA_LEN, 0.4).unwrap();
    VacuumCoordinator::new(Arc::clone(&store.store))
        .compact(VID, 0)
        .unwrap()
        .run()
        .unwrap();
    assert!(file_exists(&store, "1.g1.cpt"));

    let restarted = store.restart().unwrap();
    let volume = restarted.volume(VID).unwrap();
    assert_eq!(volume.phase(), VacuumPhase::Compacted);
    assert_eq!(volume.generation().as_u64(), 0);
    assert!(matches!(
        volume.write_needle(NeedleId::new(900), b"x"),
        Err(CoreError::VacuumInProgress { .. })
    ));

    let vacuum = VacuumCoordinator::new(restarted);
    vacuum.commit(VID).unwrap();
    assert!(!file_exists(&store, "1.g1.cpt"));
    assert_eq!(volume.generation().as_u64(), 1);
    verify_population(&volume, &population).unwrap();
}

#[test]
fn vacuum_restart_after_commit_resumes_cleanup() {
    let mut store = TestStore::disk();
    let volume = store.create_volume(VID).unwrap();
    let population = populate_with_garbage(&volume, 30, DATA_LEN, 0.4).unwrap();
    let vacuum = VacuumCoordinator::new(Arc::clone(&store.store));
    vacuum.compact(VID, 0).unwrap().run().unwrap();
    let outcome = vacuum.commit(VID).unwrap();

    let restarted = store.restart().unwrap();
    let volume = restarted.volume(VID).unwrap();
    assert_eq!(volume.generation().as_u64(), 1);
    assert_eq!(volume.phase(), VacuumPhase::CleaningUp);
    assert_eq!(volume.content_size(), outcome.volume_size);
    verify_population(&volume, &population).unwrap();

    let vacuum = VacuumCoordinator::new(restarted);
    vacuum.cleanup(VID).unwrap();
    assert_eq!(volume.phase(), VacuumPhase::Idle);
    assert!(!file_exists(&store, "1.g0.dat"));

    vacuum.cleanup(VID).unwrap();
    assert!(file_exists(&store, "1.g1.dat"));
    verify_population(&volume, &population).unwrap();
}

#[test]
fn vacuum_dropped_stream_removes_partial_file() {
    let store = TestStore::disk_with(StoreConfig::default().compaction_batch_bytes(2048));
    let volume = store.create_volume(VID).unwrap();
    populate_with_garbage(&volume, 20, DATA_LEN, 0.25).unwrap();
    let vacuum = VacuumCoordinator::new(Arc::clone(&store.store));

    let mut stream = vacuum.compact(VID, 0).unwrap();
    let first = stream.next().unwrap().unwrap();
    assert!(first.processed_bytes >= 2048);
    drop(stream);

    assert_eq!(volume.phase(), VacuumPhase::Aborted);
    assert!(!file_exists(&store, "1.g1.dat"));
    volume
        .write_needle(NeedleId::new(99), b"writable again")
        .unwrap();
}

#[test]
fn vacuum_concurrent_reads_during_commit() {
    let store = TestStore::disk_with(StoreConfig::default().compaction_batch_bytes(8192));
    let volume = store.create_volume(VID).unwrap();
    let population = populate_with_garbage(&volume, 200, 512, 0.4).unwrap();
    let vacuum = VacuumCoordinator::new(Arc::clone(&store.store));

    let stop = AtomicBool::new(false);
    let reads = AtomicU64::new(0);
    thread::scope(|s| {
        for worker in 0..4 {
            let volume = &volume;
            let population = &population;
            let stop = &stop;
            let reads = &reads;
            s.spawn(move || {
                let mut i = worker;
                while !stop.load(Ordering::SeqCst) {
                    let id = population.live[i % population.live.len()];
                    let data = volume.read_needle(id).expect("live needle must stay readable");
                    assert_eq!(data, needle_data(id, 512));
                    reads.fetch_add(1, Ordering::SeqCst);
                    i += 1;
                }
            });
        }

        for progress in vacuum.compact(VID, 0).unwrap() {
            progress.unwrap();
        }
        vacuum.commit(VID).unwrap();
        vacuum.cleanup(VID).unwrap();

        // Keep reading across the new generation for a moment.
        let after_commit = reads.load(Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while reads.load(Ordering::SeqCst) < after_commit + 100 && Instant::now() < deadline {
            thread::yield_now();
        }
        stop.store(true, Ordering::SeqCst);
    });

    assert_eq!(volume.generation().as_u64(), 1);
    verify_population(&volume, &population).unwrap();
}

#[test]
fn vacuum_on_remote_backend() {
    let store = TestStore::remote_with(StoreConfig::default().compaction_batch_bytes(4096));
    let volume = store.create_volume(VID).unwrap();
    let population = populate_with_garbage(&volume, 60, 500, 0.4).unwrap();
    let vacuum = VacuumCoordinator::new(Arc::clone(&store.store));

    assert!(vacuum.check(VID).unwrap() > 0.35);
    let samples = vacuum
        .compact(VID, 0)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert!(samples.len() > 1);
    vacuum.commit(VID).unwrap();
    vacuum.cleanup(VID).unwrap();

    let paths = store.namespace.as_ref().unwrap().paths();
    assert!(paths.iter().any(|p| p.ends_with("1.g1.dat")));
    assert!(paths.iter().any(|p| p.ends_with("1.g1.cmt")));
    assert!(!paths.iter().any(|p| p.ends_with("1.g0.dat")));
    verify_population(&volume, &population).unwrap();
}

#[test]
fn vacuum_rejects_second_compaction() {
    let store = TestStore::disk_with(StoreConfig::default().compaction_batch_bytes(1024));
    let volume = store.create_volume(VID).unwrap();
    populate_with_garbage(&volume, 10, DATA_LEN, 0.5).unwrap();
    let vacuum = VacuumCoordinator::new(Arc::clone(&store.store));

    let _running = vacuum.compact(VID, 0).unwrap();
    assert!(matches!(
        vacuum.compact(VID, 0),
        Err(CoreError::VacuumInProgress { .. })
    ));
    assert!(matches!(
        vacuum.commit(VID),
        Err(CoreError::InvalidPhase {
            phase: VacuumPhase::Compacting,
            ..
        })
    ));
}
