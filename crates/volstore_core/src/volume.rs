//! A volume: one append-only data file of needles per generation.
//!
//! The active generation (data file plus needle map) sits behind a
//! read-write lock. Reads share it; writes, the vacuum cutover and
//! sealing take it exclusively, so a reader always sees one complete
//! generation.
//!
//! ## Recovery
//!
//! On open the current generation is the highest one that is committed
//! (generation 0, or any generation with a commit marker). A finished
//! compaction into the next generation (one with a compacted marker) is
//! kept and the volume reopens waiting for its commit. Other data files of
//! newer generations are partial compactions and are removed. Older
//! generations that are still present mean a commit happened but cleanup
//! did not, and the volume reopens in the cleanup phase.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::layout::{self, FileKind};
use crate::needle::{Needle, NeedleHeader, NEEDLE_HEADER_SIZE};
use crate::needle_map::{NeedleLocation, NeedleMap};
use crate::superblock::{Superblock, SUPERBLOCK_SIZE};
use crate::types::{Generation, NeedleId, VolumeId};
use crate::vacuum::{VacuumPhase, VacuumSession, VacuumState};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use volstore_storage::{Alignment, Backend, StorageFile};

/// The generation a volume currently serves.
#[derive(Debug)]
pub(crate) struct ActiveGeneration {
    pub(crate) generation: Generation,
    pub(crate) file: Box<dyn StorageFile>,
    pub(crate) map: NeedleMap,
    /// Offset the next record is appended at.
    pub(crate) end: u64,
}

impl ActiveGeneration {
    /// Creates a fresh data file holding only a superblock.
    pub(crate) fn create(
        backend: &dyn Backend,
        volume: VolumeId,
        generation: Generation,
        alignment: Alignment,
    ) -> CoreResult<Self> {
        let name = layout::data_file(volume, generation);
        let mut file = backend.open(&name)?;
        if file.stat()?.size > 0 {
            file.truncate(0)?;
        }
        file.write_at(&Superblock::new(generation).encode(), 0)?;
        file.sync()?;

        Ok(Self {
            generation,
            file,
            map: NeedleMap::new(),
            end: Superblock::data_start(alignment),
        })
    }

    /// Opens a data file and rebuilds its needle map.
    pub(crate) fn load(
        backend: &dyn Backend,
        volume: VolumeId,
        generation: Generation,
        alignment: Alignment,
    ) -> CoreResult<Self> {
        let name = layout::data_file(volume, generation);
        let file = backend.open(&name)?;
        let size = file.stat()?.size;
        if size < SUPERBLOCK_SIZE {
            return Err(CoreError::corrupted(&name, 0, "data file shorter than superblock"));
        }

        let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
        file.read_exact_at(&mut buf, 0)?;
        let superblock = Superblock::decode(&name, &buf)?;
        if superblock.generation != generation {
            return Err(CoreError::corrupted(
                &name,
                8,
                format!("superblock names generation {}", superblock.generation),
            ));
        }

        let (map, end) = scan(&*file, &name, size, alignment)?;
        debug!(
            volume = %volume,
            generation = %generation,
            needles = map.len(),
            end,
            "loaded generation"
        );
        Ok(Self {
            generation,
            file,
            map,
            end,
        })
    }
}

/// Reads the header at `offset`.
fn read_header(file: &dyn StorageFile, offset: u64) -> CoreResult<NeedleHeader> {
    let mut buf = [0u8; NEEDLE_HEADER_SIZE as usize];
    file.read_exact_at(&mut buf, offset)?;
    Ok(NeedleHeader::decode(&buf))
}

/// Reads and verifies the whole record at `offset`.
pub(crate) fn read_record(file: &dyn StorageFile, offset: u64) -> CoreResult<Needle> {
    let header = read_header(file, offset)?;
    let mut body = vec![0u8; header.body_len() as usize];
    file.read_exact_at(&mut body, offset + NEEDLE_HEADER_SIZE)?;
    Needle::decode(header, &body)
}

/// Walks the records of a data file.
///
/// Stops at the first blank header. A damaged or incomplete final record
/// is a torn write and ends the scan; damage anywhere else is corruption.
fn scan(
    file: &dyn StorageFile,
    name: &str,
    size: u64,
    alignment: Alignment,
) -> CoreResult<(NeedleMap, u64)> {
    let mut map = NeedleMap::new();
    let mut offset = Superblock::data_start(alignment);

    while offset + NEEDLE_HEADER_SIZE <= size {
        let header = read_header(file, offset)?;
        if header.is_blank() {
            break;
        }

        let record_len = header.record_len(alignment);
        if offset + record_len > size {
            warn!(path = %name, offset, "ignoring torn record at end of file");
            break;
        }

        match read_record(file, offset) {
            Ok(_) => {}
            Err(CoreError::ChecksumMismatch { .. }) if offset + record_len == size => {
                warn!(path = %name, offset, "ignoring damaged final record");
                break;
            }
            Err(CoreError::ChecksumMismatch { needle, .. }) => {
                return Err(CoreError::corrupted(
                    name,
                    offset,
                    format!("checksum mismatch on needle {needle}"),
                ));
            }
            Err(e) => return Err(e),
        }

        if header.flags.is_tombstone() {
            map.delete(header.id, record_len);
        } else {
            map.put(
                header.id,
                NeedleLocation {
                    offset,
                    data_len: header.data_len,
                    record_len,
                },
            );
        }
        offset += record_len;
    }

    Ok((map, offset))
}

/// A point-in-time description of a volume.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    /// Volume id.
    pub id: VolumeId,
    /// Generation being served.
    pub generation: Generation,
    /// Bytes used by the data file.
    pub size: u64,
    /// Number of live needles.
    pub needle_count: usize,
    /// Bytes of records backing live needles.
    pub live_bytes: u64,
    /// Bytes compaction can reclaim.
    pub garbage_bytes: u64,
    /// `garbage_bytes / size`.
    pub garbage_ratio: f64,
    /// Whether writes are refused.
    pub read_only: bool,
    /// Whether the volume is sealed.
    pub sealed: bool,
    /// Current vacuum phase.
    pub phase: VacuumPhase,
}

/// One volume of a [`crate::Store`].
#[derive(Debug)]
pub struct Volume {
    id: VolumeId,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) config: StoreConfig,
    pub(crate) active: RwLock<ActiveGeneration>,
    pub(crate) read_only: AtomicBool,
    sealed: AtomicBool,
    /// Set while a compaction's result is not yet committed or discarded.
    pub(crate) vacuuming: AtomicBool,
    pub(crate) vacuum: Mutex<VacuumState>,
}

impl Volume {
    /// Creates a new, empty volume.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VolumeExists`] if the backend already holds
    /// files of this volume.
    pub fn create(id: VolumeId, backend: Arc<dyn Backend>, config: StoreConfig) -> CoreResult<Self> {
        let existing = backend
            .list(&layout::volume_prefix(id))?
            .iter()
            .any(|name| matches!(layout::parse(name), Some((vid, _)) if vid == id));
        if existing {
            return Err(CoreError::VolumeExists { volume: id });
        }

        let active =
            ActiveGeneration::create(&*backend, id, Generation::INITIAL, config.alignment())?;
        info!(volume = %id, backend = %backend.kind(), "created volume");
        Ok(Self::assemble(id, backend, config, active, false, VacuumPhase::Idle))
    }

    /// Opens an existing volume, recovering from an interrupted vacuum.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VolumeNotFound`] if the backend holds no data
    /// file of this volume.
    pub fn open(id: VolumeId, backend: Arc<dyn Backend>, config: StoreConfig) -> CoreResult<Self> {
        let mut data = BTreeSet::new();
        let mut markers = BTreeSet::new();
        let mut compacted = BTreeSet::new();
        let mut sealed = false;
        for name in backend.list(&layout::volume_prefix(id))? {
            match layout::parse(&name) {
                Some((vid, FileKind::Data(g))) if vid == id => {
                    data.insert(g);
                }
                Some((vid, FileKind::CommitMarker(g))) if vid == id => {
                    markers.insert(g);
                }
                Some((vid, FileKind::CompactedMarker(g))) if vid == id => {
                    compacted.insert(g);
                }
                Some((vid, FileKind::Sealed)) if vid == id => sealed = true,
                _ => {}
            }
        }
        if data.is_empty() {
            return Err(CoreError::VolumeNotFound { volume: id });
        }

        let current = data
            .iter()
            .copied()
            .filter(|g| *g == Generation::INITIAL || markers.contains(g))
            .max()
            .ok_or_else(|| {
                CoreError::corrupted(layout::volume_prefix(id), 0, "no committed generation")
            })?;
        let alignment = config.alignment();

        // A finished compaction into the next generation survives a restart.
        let candidate = current.next();
        let mut pending = None;
        if data.contains(&candidate) && compacted.contains(&candidate) {
            match ActiveGeneration::load(&*backend, id, candidate, alignment) {
                Ok(generation) => pending = Some(generation),
                Err(e) => {
                    warn!(volume = %id, generation = %candidate, error = %e, "discarding unreadable compaction")
                }
            }
        }
        let keep = pending.as_ref().map(|p| p.generation);

        for generation in data.range(current.next()..) {
            if Some(*generation) != keep {
                warn!(volume = %id, generation = %generation, "removing uncommitted compaction");
                backend.remove(&layout::data_file(id, *generation))?;
            }
        }
        for generation in markers.range(current.next()..) {
            backend.remove(&layout::commit_marker(id, *generation))?;
        }
        for generation in &compacted {
            if Some(*generation) != keep {
                backend.remove(&layout::compacted_marker(id, *generation))?;
            }
        }

        let active = ActiveGeneration::load(&*backend, id, current, alignment)?;
        let phase = if pending.is_some() {
            VacuumPhase::Compacted
        } else if data.range(..current).next().is_some() {
            VacuumPhase::CleaningUp
        } else {
            VacuumPhase::Idle
        };
        info!(
            volume = %id,
            generation = %current,
            needles = active.map.len(),
            sealed,
            phase = %phase,
            "opened volume"
        );

        let volume = Self::assemble(id, backend, config, active, sealed, phase);
        if pending.is_some() {
            volume.vacuuming.store(true, Ordering::SeqCst);
            volume.vacuum.lock().pending = pending;
        }
        Ok(volume)
    }

    fn assemble(
        id: VolumeId,
        backend: Arc<dyn Backend>,
        config: StoreConfig,
        active: ActiveGeneration,
        sealed: bool,
        phase: VacuumPhase,
    ) -> Self {
        Self {
            id,
            backend,
            config,
            active: RwLock::new(active),
            read_only: AtomicBool::new(false),
            sealed: AtomicBool::new(sealed),
            vacuuming: AtomicBool::new(false),
            vacuum: Mutex::new(VacuumState::new(phase)),
        }
    }

    /// Returns the volume id.
    #[must_use]
    pub fn id(&self) -> VolumeId {
        self.id
    }

    /// Returns the generation being served.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.active.read().generation
    }

    /// Returns the bytes used by the data file.
    #[must_use]
    pub fn content_size(&self) -> u64 {
        self.active.read().end
    }

    /// Returns the number of live needles.
    #[must_use]
    pub fn needle_count(&self) -> usize {
        self.active.read().map.len()
    }

    /// Returns the fraction of the data file that compaction can reclaim.
    #[must_use]
    pub fn garbage_ratio(&self) -> f64 {
        let active = self.active.read();
        if active.end == 0 {
            0.0
        } else {
            active.map.garbage_bytes() as f64 / active.end as f64
        }
    }

    /// Returns true if writes are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst) || self.is_sealed()
    }

    /// Sets the read-only policy. A sealed volume stays read-only.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Returns true once the volume is sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Returns the current vacuum phase.
    #[must_use]
    pub fn phase(&self) -> VacuumPhase {
        self.vacuum.lock().phase
    }

    /// Returns the running or last finished vacuum session, if any.
    #[must_use]
    pub fn vacuum_session(&self) -> Option<VacuumSession> {
        self.vacuum.lock().session.clone()
    }

    /// Returns a point-in-time description.
    #[must_use]
    pub fn info(&self) -> VolumeInfo {
        let phase = self.phase();
        let active = self.active.read();
        VolumeInfo {
            id: self.id,
            generation: active.generation,
            size: active.end,
            needle_count: active.map.len(),
            live_bytes: active.map.live_bytes(),
            garbage_bytes: active.map.garbage_bytes(),
            garbage_ratio: if active.end == 0 {
                0.0
            } else {
                active.map.garbage_bytes() as f64 / active.end as f64
            },
            read_only: self.is_read_only(),
            sealed: self.is_sealed(),
            phase,
        }
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.is_read_only() {
            return Err(CoreError::ReadOnly { volume: self.id });
        }
        if self.vacuuming.load(Ordering::SeqCst) {
            return Err(CoreError::VacuumInProgress { volume: self.id });
        }
        Ok(())
    }

    fn append(&self, active: &mut ActiveGeneration, record: &[u8]) -> CoreResult<u64> {
        let offset = active.end;
        active.file.write_at(record, offset)?;
        if self.config.sync_on_write {
            active.file.sync()?;
        }
        active.end += record.len() as u64;
        Ok(offset)
    }

    /// Appends a needle, superseding any earlier one with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] or [`CoreError::VacuumInProgress`]
    /// if the volume refuses writes.
    pub fn write_needle(&self, id: NeedleId, data: &[u8]) -> CoreResult<NeedleLocation> {
        if id.is_reserved() {
            return Err(CoreError::invalid_operation("needle id 0 is reserved"));
        }
        let needle = Needle::put(id, data.to_vec());
        let mut record = Vec::new();
        let record_len = needle.encode_into(self.config.alignment(), &mut record)?;

        let mut active = self.active.write();
        self.check_writable()?;
        let offset = self.append(&mut active, &record)?;
        let location = NeedleLocation {
            offset,
            data_len: data.len() as u32,
            record_len,
        };
        active.map.put(id, location);

        debug!(volume = %self.id, needle = %id, offset, len = data.len(), "wrote needle");
        Ok(location)
    }

    /// Reads a live needle's data.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NeedleNotFound`] for unknown or deleted needles.
    pub fn read_needle(&self, id: NeedleId) -> CoreResult<Vec<u8>> {
        let active = self.active.read();
        let location = active.map.get(id).ok_or(CoreError::NeedleNotFound {
            volume: self.id,
            needle: id,
        })?;

        let needle = read_record(&*active.file, location.offset)?;
        if needle.id != id {
            return Err(CoreError::corrupted(
                active.file.name(),
                location.offset,
                format!("expected needle {id}, found {}", needle.id),
            ));
        }
        Ok(needle.data)
    }

    /// Deletes a needle by appending a tombstone.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NeedleNotFound`] if the needle is not live.
    pub fn delete_needle(&self, id: NeedleId) -> CoreResult<()> {
        let mut record = Vec::new();
        let record_len = Needle::tombstone(id).encode_into(self.config.alignment(), &mut record)?;

        let mut active = self.active.write();
        self.check_writable()?;
        if active.map.get(id).is_none() {
            return Err(CoreError::NeedleNotFound {
                volume: self.id,
                needle: id,
            });
        }
        self.append(&mut active, &record)?;
        active.map.delete(id, record_len);

        debug!(volume = %self.id, needle = %id, "deleted needle");
        Ok(())
    }

    /// Makes all written needles durable.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.active.write().file.sync()?;
        Ok(())
    }

    /// Seals the volume: it stays read-only from now on, across restarts,
    /// and becomes eligible for archival.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VacuumInProgress`] while a vacuum holds the volume.
    pub fn seal(&self) -> CoreResult<()> {
        let mut active = self.active.write();
        if self.is_sealed() {
            return Ok(());
        }
        if self.vacuuming.load(Ordering::SeqCst) {
            return Err(CoreError::VacuumInProgress { volume: self.id });
        }

        active.file.sync()?;
        let mut marker = self.backend.open(&layout::sealed_marker(self.id))?;
        marker.sync()?;
        marker.close()?;
        self.sealed.store(true, Ordering::SeqCst);

        info!(volume = %self.id, size = active.end, "sealed volume");
        Ok(())
    }

    /// Runs `f` on the active data file under the read lock.
    pub fn with_data_file<R>(&self, f: impl FnOnce(&dyn StorageFile) -> R) -> R {
        let active = self.active.read();
        f(&*active.file)
    }

    /// Closes the data file and any uncommitted compaction result.
    ///
    /// # Errors
    ///
    /// Returns the backend error if closing the data file fails.
    pub fn close(&self) -> CoreResult<()> {
        {
            let mut state = self.vacuum.lock();
            if let Some(mut pending) = state.pending.take() {
                if let Err(e) = pending.file.close() {
                    warn!(volume = %self.id, error = %e, "failed to close uncommitted generation");
                }
            }
        }
        self.active.write().file.close()?;
        debug!(volume = %self.id, "closed volume");
        Ok(())
    }
}
