//! Compaction: copying live needles into the next generation.
//!
//! The copy runs while readers keep using the current generation.
//! Writers are refused from the moment compaction starts until its result
//! is committed or discarded, so the snapshot of live needles taken at the
//! start stays complete.

use crate::error::{CoreError, CoreResult};
use crate::layout;
use crate::needle_map::NeedleLocation;
use crate::types::{Generation, NeedleId};
use crate::vacuum::phase::{CompactProgress, VacuumPhase, VacuumSession};
use crate::volume::{read_record, ActiveGeneration, Volume};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::vec;
use tracing::{debug, info, warn};
use volstore_storage::{Alignment, StorageFile};

/// Returns the 1-minute load average, or 0.0 where the platform does not
/// report one.
#[must_use]
pub fn load_average_1m() -> f32 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next()?.parse().ok())
        .unwrap_or(0.0)
}

impl Volume {
    pub(crate) fn begin_compaction(self: &Arc<Self>, preallocate: u64) -> CoreResult<CompactStream> {
        let mut state = self.vacuum.lock();
        match state.phase {
            phase if phase.is_busy() => {
                return Err(CoreError::VacuumInProgress { volume: self.id() })
            }
            VacuumPhase::CleaningUp => {
                return Err(CoreError::invalid_phase(self.id(), state.phase, "compact"))
            }
            VacuumPhase::Compacted => {
                if let Some(pending) = state.pending.take() {
                    info!(
                        volume = %self.id(),
                        generation = %pending.generation,
                        "discarding uncommitted compaction"
                    );
                    self.discard_generation(pending);
                }
                self.vacuuming.store(false, Ordering::SeqCst);
                state.phase = VacuumPhase::Aborted;
            }
            _ => {}
        }
        self.backend.reserve(preallocate)?;

        // Sealing checks the vacuuming flag under the same write lock.
        let (source, plan, garbage_ratio) = {
            let active = self.active.write();
            if self.is_sealed() {
                return Err(CoreError::ReadOnly { volume: self.id() });
            }
            self.vacuuming.store(true, Ordering::SeqCst);
            let ratio = if active.end == 0 {
                0.0
            } else {
                active.map.garbage_bytes() as f64 / active.end as f64
            };
            (active.generation, active.map.live_by_offset(), ratio)
        };
        let destination = source.next();

        let files = self.open_compaction_files(source, destination);
        let (source_file, output) = match files {
            Ok(files) => files,
            Err(e) => {
                self.vacuuming.store(false, Ordering::SeqCst);
                state.phase = VacuumPhase::Aborted;
                return Err(e);
            }
        };

        let total_bytes = plan.iter().map(|(_, loc)| loc.record_len).sum();
        state.phase = VacuumPhase::Compacting;
        state.session = Some(VacuumSession {
            source,
            destination,
            garbage_ratio,
            processed_bytes: 0,
            total_bytes,
        });
        info!(
            volume = %self.id(),
            from = %source,
            to = %destination,
            needles = plan.len(),
            total_bytes,
            "compaction started"
        );

        Ok(CompactStream {
            volume: Arc::clone(self),
            alignment: self.config.alignment(),
            batch_bytes: self.config.compaction_batch_bytes,
            source: Some(source_file),
            output: Some(output),
            plan: plan.into_iter(),
            processed: 0,
            done: false,
        })
    }

    /// Opens a second handle on the source generation and starts the output.
    fn open_compaction_files(
        &self,
        source: Generation,
        destination: Generation,
    ) -> CoreResult<(Box<dyn StorageFile>, ActiveGeneration)> {
        // Leftovers of an earlier failed attempt.
        for marker in [
            layout::commit_marker(self.id(), destination),
            layout::compacted_marker(self.id(), destination),
        ] {
            if self.backend.exists(&marker)? {
                self.backend.remove(&marker)?;
            }
        }
        let source_file = self.backend.open(&layout::data_file(self.id(), source))?;
        let output =
            ActiveGeneration::create(&*self.backend, self.id(), destination, self.config.alignment())?;
        Ok((source_file, output))
    }

    /// Creates an empty marker file and makes it durable.
    pub(crate) fn write_marker(&self, name: &str) -> CoreResult<()> {
        let mut marker = self.backend.open(name)?;
        marker.sync()?;
        marker.close()?;
        Ok(())
    }

    /// Closes and removes an uncommitted generation.
    pub(crate) fn discard_generation(&self, mut generation: ActiveGeneration) {
        if let Err(e) = generation.file.close() {
            warn!(volume = %self.id(), error = %e, "failed to close discarded generation");
        }
        for name in [
            layout::compacted_marker(self.id(), generation.generation),
            layout::data_file(self.id(), generation.generation),
        ] {
            if let Err(e) = self.backend.remove(&name) {
                warn!(volume = %self.id(), path = %name, error = %e, "failed to remove discarded generation");
            }
        }
    }
}

/// A running compaction.
///
/// Each call to `next` copies up to one batch of live needles and yields
/// a progress sample. After the last batch the result is synced and the
/// volume moves to [`VacuumPhase::Compacted`]. An error is yielded once,
/// after which the stream ends.
///
/// Dropping the stream before it finishes abandons the compaction and
/// removes the partial generation file.
#[derive(Debug)]
pub struct CompactStream {
    volume: Arc<Volume>,
    alignment: Alignment,
    batch_bytes: u64,
    source: Option<Box<dyn StorageFile>>,
    output: Option<ActiveGeneration>,
    plan: vec::IntoIter<(NeedleId, NeedleLocation)>,
    processed: u64,
    done: bool,
}

impl CompactStream {
    /// Returns the bytes of live records copied so far.
    #[must_use]
    pub fn processed_bytes(&self) -> u64 {
        self.processed
    }

    /// Drives the stream to completion and returns the final sample.
    ///
    /// # Errors
    ///
    /// Returns the first error the compaction hit.
    pub fn run(mut self) -> CoreResult<CompactProgress> {
        let mut last = CompactProgress {
            processed_bytes: 0,
            load_avg_1m: load_average_1m(),
        };
        for progress in &mut self {
            last = progress?;
        }
        Ok(last)
    }

    fn step(&mut self) -> CoreResult<CompactProgress> {
        let (Some(source), Some(output)) = (self.source.as_ref(), self.output.as_mut()) else {
            return Err(CoreError::compaction_aborted(self.volume.id(), "stream already finished"));
        };

        let mut batch = Vec::new();
        let mut read = 0u64;
        let mut copied = Vec::new();
        while (batch.len() as u64) < self.batch_bytes {
            let Some((id, location)) = self.plan.next() else {
                break;
            };
            let needle = read_record(&**source, location.offset)?;
            if needle.id != id {
                return Err(CoreError::corrupted(
                    source.name(),
                    location.offset,
                    format!("expected needle {id}, found {}", needle.id),
                ));
            }

            let offset = output.end + batch.len() as u64;
            let record_len = needle.encode_into(self.alignment, &mut batch)?;
            copied.push((
                id,
                NeedleLocation {
                    offset,
                    data_len: location.data_len,
                    record_len,
                },
            ));
            read += location.record_len;
        }

        if !batch.is_empty() {
            output.file.write_at(&batch, output.end)?;
            output.end += batch.len() as u64;
            for (id, location) in copied {
                output.map.put(id, location);
            }
        }
        self.processed += read;

        {
            let mut state = self.volume.vacuum.lock();
            if let Some(session) = state.session.as_mut() {
                session.processed_bytes = self.processed;
            }
        }
        debug!(volume = %self.volume.id(), processed = self.processed, "compaction batch");

        if self.plan.len() == 0 {
            self.finish()?;
        }
        Ok(CompactProgress {
            processed_bytes: self.processed,
            load_avg_1m: load_average_1m(),
        })
    }

    fn finish(&mut self) -> CoreResult<()> {
        if let Some(output) = self.output.as_mut() {
            output.file.sync()?;
            self.volume
                .write_marker(&layout::compacted_marker(self.volume.id(), output.generation))?;
        }
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.close() {
                warn!(volume = %self.volume.id(), error = %e, "failed to close compaction source");
            }
        }
        let Some(output) = self.output.take() else {
            return Ok(());
        };

        let mut state = self.volume.vacuum.lock();
        if state.phase != VacuumPhase::Compacting {
            drop(state);
            self.volume.discard_generation(output);
            return Err(CoreError::compaction_aborted(
                self.volume.id(),
                "volume left the compacting phase",
            ));
        }
        info!(
            volume = %self.volume.id(),
            generation = %output.generation,
            size = output.end,
            needles = output.map.len(),
            "compaction finished"
        );
        state.pending = Some(output);
        state.phase = VacuumPhase::Compacted;
        Ok(())
    }

    fn abort(&mut self, reason: &str) {
        if let Some(mut source) = self.source.take() {
            let _ = source.close();
        }
        if let Some(output) = self.output.take() {
            self.volume.discard_generation(output);
        }

        let mut state = self.volume.vacuum.lock();
        if state.phase == VacuumPhase::Compacting {
            state.phase = VacuumPhase::Aborted;
            state.session = None;
            self.volume.vacuuming.store(false, Ordering::SeqCst);
        }
        warn!(volume = %self.volume.id(), reason, "compaction aborted");
    }
}

impl Iterator for CompactStream {
    type Item = CoreResult<CompactProgress>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.step();
        match &result {
            Ok(_) => self.done = self.output.is_none(),
            Err(e) => {
                self.abort(&e.to_string());
                self.done = true;
            }
        }
        Some(result)
    }
}

impl Drop for CompactStream {
    fn drop(&mut self) {
        if !self.done {
            self.abort("progress stream dropped");
        }
    }
}
