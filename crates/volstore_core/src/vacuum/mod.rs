//! Online volume vacuum.
//!
//! A vacuum reclaims the space of deleted and superseded needles in four
//! steps driven by an external scheduler:
//!
//! 1. `check` reports the garbage ratio
//! 2. `compact` copies live needles into generation N+1 while reads
//!    continue against generation N
//! 3. `commit` makes N+1 current
//! 4. `cleanup` removes the files of N
//!
//! ## Commit protocol
//!
//! A finished compaction syncs N+1 and then writes its compacted marker,
//! so a restart between compact and commit resumes in the compacted
//! phase. Generation N+1 becomes current the moment its commit marker is
//! synced. Until then a crash leaves N current; afterwards N+1 is current
//! and N is left for cleanup. Making
//! N+1 current in memory happens under the volume's write lock, so
//! concurrent readers see either generation whole and never a mix.

mod compact;
mod phase;

pub use compact::{load_average_1m, CompactStream};
pub use phase::{CommitOutcome, CompactProgress, VacuumPhase, VacuumSession};
pub(crate) use phase::VacuumState;

use crate::error::{CoreError, CoreResult};
use crate::layout::{self, FileKind};
use crate::store::Store;
use crate::types::VolumeId;
use crate::volume::Volume;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

impl Volume {
    fn vacuum_check(&self) -> f64 {
        let mut state = self.vacuum.lock();
        let resting = matches!(state.phase, VacuumPhase::Idle | VacuumPhase::Aborted);
        if resting {
            state.phase = VacuumPhase::Checking;
        }
        let ratio = self.garbage_ratio();
        if resting {
            state.phase = VacuumPhase::Idle;
        }
        info!(volume = %self.id(), ratio, "vacuum check");
        ratio
    }

    fn vacuum_commit(&self) -> CoreResult<CommitOutcome> {
        let mut state = self.vacuum.lock();
        if state.phase != VacuumPhase::Compacted {
            return Err(CoreError::invalid_phase(self.id(), state.phase, "commit"));
        }
        let Some(pending) = state.pending.take() else {
            return Err(CoreError::invalid_phase(self.id(), state.phase, "commit"));
        };

        state.phase = VacuumPhase::Committing;
        let was_read_only = self.read_only.swap(true, Ordering::SeqCst);

        let marker = layout::commit_marker(self.id(), pending.generation);
        if let Err(e) = self.write_marker(&marker) {
            if let Err(remove) = self.backend.remove(&marker) {
                warn!(volume = %self.id(), error = %remove, "failed to remove partial commit marker");
            }
            self.read_only.store(was_read_only, Ordering::SeqCst);
            state.pending = Some(pending);
            state.phase = VacuumPhase::Compacted;
            warn!(volume = %self.id(), error = %e, "commit failed");
            return Err(e);
        }

        let generation = pending.generation;
        let volume_size = pending.end;
        let compacted = layout::compacted_marker(self.id(), generation);
        if let Err(e) = self.backend.remove(&compacted) {
            warn!(volume = %self.id(), path = %compacted, error = %e, "failed to remove compacted marker");
        }
        let mut previous = std::mem::replace(&mut *self.active.write(), pending);
        if let Err(e) = previous.file.close() {
            warn!(volume = %self.id(), error = %e, "failed to close previous generation");
        }

        self.read_only.store(was_read_only, Ordering::SeqCst);
        self.vacuuming.store(false, Ordering::SeqCst);
        state.phase = VacuumPhase::CleaningUp;
        info!(
            volume = %self.id(),
            from = %previous.generation,
            to = %generation,
            size = volume_size,
            "vacuum committed"
        );

        Ok(CommitOutcome {
            is_read_only: self.is_read_only(),
            volume_size,
        })
    }

    fn vacuum_cleanup(&self) -> CoreResult<()> {
        let mut state = self.vacuum.lock();
        if state.phase.is_busy() {
            return Err(CoreError::VacuumInProgress { volume: self.id() });
        }
        let keep_pending = state.phase == VacuumPhase::Compacted;
        let current = self.generation();

        let mut removed = 0usize;
        for name in self.backend.list(&layout::volume_prefix(self.id()))? {
            let stale = match layout::parse(&name) {
                Some((vid, kind)) if vid == self.id() => match kind {
                    FileKind::Data(g) | FileKind::CommitMarker(g) => {
                        g < current || (g > current && !keep_pending)
                    }
                    FileKind::CompactedMarker(g) => g <= current || !keep_pending,
                    FileKind::Sealed => false,
                },
                _ => false,
            };
            if stale {
                self.backend.remove(&name)?;
                removed += 1;
            }
        }

        if matches!(state.phase, VacuumPhase::CleaningUp | VacuumPhase::Aborted) {
            state.phase = VacuumPhase::Idle;
        }
        info!(volume = %self.id(), removed, "vacuum cleanup");
        Ok(())
    }

    fn vacuum_abort(&self) -> CoreResult<()> {
        let mut state = self.vacuum.lock();
        match state.phase {
            VacuumPhase::Compacted => {
                if let Some(pending) = state.pending.take() {
                    self.discard_generation(pending);
                }
                self.vacuuming.store(false, Ordering::SeqCst);
                state.phase = VacuumPhase::Aborted;
                state.session = None;
                info!(volume = %self.id(), "discarded uncommitted compaction");
                Ok(())
            }
            phase if phase.is_busy() => Err(CoreError::VacuumInProgress { volume: self.id() }),
            phase => Err(CoreError::invalid_phase(self.id(), phase, "abort")),
        }
    }
}

/// Entry point for the vacuum phases of a store's volumes.
///
/// The coordinator holds no state of its own; each volume tracks its
/// phase, and at most one vacuum runs per volume.
#[derive(Debug, Clone)]
pub struct VacuumCoordinator {
    store: Arc<Store>,
}

impl VacuumCoordinator {
    /// Creates a coordinator for `store`.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Returns the fraction of the volume's data file that compaction can
    /// reclaim.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VolumeNotFound`] for unknown volumes.
    pub fn check(&self, volume: VolumeId) -> CoreResult<f64> {
        Ok(self.store.volume(volume)?.vacuum_check())
    }

    /// Starts compacting the volume into its next generation.
    ///
    /// `preallocate` is a hint for the size of the new data file; backends
    /// that can check free space refuse hints they cannot satisfy.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VacuumInProgress`] if a compaction or commit
    /// is running, [`CoreError::InvalidPhase`] if the previous vacuum is
    /// not cleaned up, and [`CoreError::ReadOnly`] for sealed volumes.
    pub fn compact(&self, volume: VolumeId, preallocate: u64) -> CoreResult<CompactStream> {
        self.store.volume(volume)?.begin_compaction(preallocate)
    }

    /// Makes the compacted generation current.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPhase`] unless a compaction has
    /// finished. If the commit marker cannot be written the volume stays
    /// on its old generation in the compacted phase and commit can be
    /// retried.
    pub fn commit(&self, volume: VolumeId) -> CoreResult<CommitOutcome> {
        self.store.volume(volume)?.vacuum_commit()
    }

    /// Removes generation files the volume no longer serves. Safe to run
    /// repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VacuumInProgress`] while a compaction or
    /// commit is running.
    pub fn cleanup(&self, volume: VolumeId) -> CoreResult<()> {
        self.store.volume(volume)?.vacuum_cleanup()
    }

    /// Discards a finished compaction that has not been committed.
    ///
    /// A running compaction is abandoned by dropping its stream instead.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPhase`] unless the volume is in the
    /// compacted phase.
    pub fn abort(&self, volume: VolumeId) -> CoreResult<()> {
        self.store.volume(volume)?.vacuum_abort()
    }

    /// Returns the running or last compaction session of a volume.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VolumeNotFound`] for unknown volumes.
    pub fn session(&self, volume: VolumeId) -> CoreResult<Option<VacuumSession>> {
        Ok(self.store.volume(volume)?.vacuum_session())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::types::NeedleId;
    use volstore_storage::{Backend, DiskBackend};
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> (Arc<Store>, VacuumCoordinator) {
        let config = StoreConfig::default().compaction_batch_bytes(256);
        let backend: Arc<dyn Backend> = Arc::new(DiskBackend::open(dir, &config.storage).unwrap());
        let store = Arc::new(Store::open(backend, config).unwrap());
        let volume = store.create_volume(VolumeId::new(1)).unwrap();
        for i in 1..=10u64 {
            volume.write_needle(NeedleId::new(i), &[i as u8; 100]).unwrap();
        }
        for i in 1..=4u64 {
            volume.delete_needle(NeedleId::new(i)).unwrap();
        }
        let coordinator = VacuumCoordinator::new(Arc::clone(&store));
        (store, coordinator)
    }

    #[test]
    fn vacuum_full_cycle() {
        let dir = tempdir().unwrap();
        let (store, vacuum) = setup(dir.path());
        let vid = VolumeId::new(1);
        let volume = store.volume(vid).unwrap();

        assert!(vacuum.check(vid).unwrap() > 0.3);
        assert_eq!(volume.phase(), VacuumPhase::Idle);

        let samples: Vec<_> = vacuum.compact(vid, 0).unwrap().collect::<CoreResult<_>>().unwrap();
        assert!(samples.len() > 1);
        assert!(samples.windows(2).all(|w| w[0].processed_bytes <= w[1].processed_bytes));
        assert_eq!(volume.phase(), VacuumPhase::Compacted);

        let outcome = vacuum.commit(vid).unwrap();
        assert!(!outcome.is_read_only);
        assert_eq!(outcome.volume_size, volume.content_size());
        assert_eq!(volume.phase(), VacuumPhase::CleaningUp);
        assert_eq!(volume.generation().as_u64(), 1);
        assert_eq!(volume.garbage_ratio(), 0.0);

        vacuum.cleanup(vid).unwrap();
        assert_eq!(volume.phase(), VacuumPhase::Idle);
        assert!(!dir.path().join("1.g0.dat").exists());

        for i in 5..=10u64 {
            assert_eq!(volume.read_needle(NeedleId::new(i)).unwrap(), vec![i as u8; 100]);
        }
        volume.write_needle(NeedleId::new(11), b"after").unwrap();
    }

    #[test]
    fn vacuum_commit_requires_compacted() {
        let dir = tempdir().unwrap();
        let (_store, vacuum) = setup(dir.path());
        let err = vacuum.commit(VolumeId::new(1)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPhase { phase: VacuumPhase::Idle, .. }));
    }

    #[test]
    fn vacuum_rejects_writes_until_commit() {
        let dir = tempdir().unwrap();
        let (store, vacuum) = setup(dir.path());
        let vid = VolumeId::new(1);
        let volume = store.volume(vid).unwrap();

        let mut stream = vacuum.compact(vid, 0).unwrap();
        stream.next().unwrap().unwrap();
        assert!(matches!(
            volume.write_needle(NeedleId::new(99), b"x"),
            Err(CoreError::VacuumInProgress { .. })
        ));
        assert!(matches!(vacuum.compact(vid, 0), Err(CoreError::VacuumInProgress { .. })));
        assert!(matches!(vacuum.cleanup(vid), Err(CoreError::VacuumInProgress { .. })));

        stream.run().unwrap();
        assert!(volume.write_needle(NeedleId::new(99), b"x").is_err());
        vacuum.commit(vid).unwrap();
        volume.write_needle(NeedleId::new(99), b"x").unwrap();
    }

    #[test]
    fn vacuum_abort_discards_result() {
        let dir = tempdir().unwrap();
        let (store, vacuum) = setup(dir.path());
        let vid = VolumeId::new(1);
        let volume = store.volume(vid).unwrap();

        vacuum.compact(vid, 0).unwrap().run().unwrap();
        assert!(dir.path().join("1.g1.dat").exists());
        vacuum.abort(vid).unwrap();

        assert_eq!(volume.phase(), VacuumPhase::Aborted);
        assert!(!dir.path().join("1.g1.dat").exists());
        assert_eq!(volume.generation().as_u64(), 0);
        volume.write_needle(NeedleId::new(99), b"x").unwrap();

        // A new compaction may start from the aborted phase.
        vacuum.compact(vid, 0).unwrap().run().unwrap();
        vacuum.commit(vid).unwrap();
    }

    #[test]
    fn vacuum_compact_again_replaces_uncommitted_result() {
        let dir = tempdir().unwrap();
        let (store, vacuum) = setup(dir.path());
        let vid = VolumeId::new(1);

        vacuum.compact(vid, 0).unwrap().run().unwrap();
        vacuum.compact(vid, 0).unwrap().run().unwrap();
        vacuum.commit(vid).unwrap();
        assert_eq!(store.volume(vid).unwrap().needle_count(), 6);
    }

    #[test]
    fn vacuum_compact_refused_before_cleanup() {
        let dir = tempdir().unwrap();
        let (_store, vacuum) = setup(dir.path());
        let vid = VolumeId::new(1);

        vacuum.compact(vid, 0).unwrap().run().unwrap();
        vacuum.commit(vid).unwrap();
        assert!(matches!(
            vacuum.compact(vid, 0),
            Err(CoreError::InvalidPhase { phase: VacuumPhase::CleaningUp, .. })
        ));
        vacuum.cleanup(vid).unwrap();
        vacuum.compact(vid, 0).unwrap().run().unwrap();
    }

    #[test]
    fn vacuum_sealed_volume_is_not_compacted() {
        let dir = tempdir().unwrap();
        let (store, vacuum) = setup(dir.path());
        let vid = VolumeId::new(1);
        store.volume(vid).unwrap().seal().unwrap();
        assert!(matches!(vacuum.compact(vid, 0), Err(CoreError::ReadOnly { .. })));
    }

    #[test]
    fn vacuum_seal_refused_while_compacting() {
        let dir = tempdir().unwrap();
        let (store, vacuum) = setup(dir.path());
        let vid = VolumeId::new(1);
        let volume = store.volume(vid).unwrap();

        let mut stream = vacuum.compact(vid, 0).unwrap();
        stream.next().unwrap().unwrap();
        assert!(matches!(volume.seal(), Err(CoreError::VacuumInProgress { .. })));
        assert!(!volume.is_sealed());

        stream.run().unwrap();
        assert!(matches!(volume.seal(), Err(CoreError::VacuumInProgress { .. })));
        vacuum.commit(vid).unwrap();
        volume.seal().unwrap();
        assert!(volume.is_sealed());
    }

    #[test]
    fn vacuum_seal_and_compact_race_has_one_winner() {
        for _ in 0..50 {
            let dir = tempdir().unwrap();
            let (store, vacuum) = setup(dir.path());
            let vid = VolumeId::new(1);
            let volume = store.volume(vid).unwrap();
            let barrier = std::sync::Barrier::new(2);

            let (sealed, compacted) = std::thread::scope(|s| {
                let sealer = s.spawn(|| {
                    barrier.wait();
                    volume.seal()
                });
                barrier.wait();
                let compacted = vacuum.compact(vid, 0).map(CompactStream::run);
                (sealer.join().unwrap(), compacted)
            });

            match (sealed, compacted) {
                (Ok(()), Err(CoreError::ReadOnly { .. })) => {
                    assert_eq!(volume.phase(), VacuumPhase::Idle);
                }
                (Err(CoreError::VacuumInProgress { .. }), Ok(result)) => {
                    result.unwrap();
                    assert!(!volume.is_sealed());
                }
                (sealed, compacted) => {
                    panic!("seal {sealed:?} and compact {:?} both decided", compacted.map(|_| ()))
                }
            }
        }
    }

    #[test]
    fn vacuum_session_reports_progress() {
        let dir = tempdir().unwrap();
        let (_store, vacuum) = setup(dir.path());
        let vid = VolumeId::new(1);

        let mut stream = vacuum.compact(vid, 0).unwrap();
        let session = vacuum.session(vid).unwrap().unwrap();
        assert_eq!(session.source.as_u64(), 0);
        assert_eq!(session.destination.as_u64(), 1);
        assert_eq!(session.total_bytes, 6 * 120);

        let first = stream.next().unwrap().unwrap();
        assert_eq!(
            vacuum.session(vid).unwrap().unwrap().processed_bytes,
            first.processed_bytes
        );
    }
}
