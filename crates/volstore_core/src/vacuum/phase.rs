//! Vacuum phases and the per-volume vacuum state.

use crate::types::Generation;
use crate::volume::ActiveGeneration;
use std::fmt;

/// Where a volume is in the vacuum lifecycle.
///
/// ```text
/// Idle -> Checking -> Idle
/// Idle -> Compacting -> Compacted -> Committing -> CleaningUp -> Idle
///            |              |            |
///            v              v            v
///         Aborted        (discard)   Compacted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VacuumPhase {
    /// No vacuum activity.
    #[default]
    Idle,
    /// Computing the garbage ratio.
    Checking,
    /// Copying live needles into the next generation.
    Compacting,
    /// Compaction finished; the result awaits commit.
    Compacted,
    /// Swapping the compacted generation in.
    Committing,
    /// Committed; older generation files await removal.
    CleaningUp,
    /// The last compaction was abandoned.
    Aborted,
}

impl VacuumPhase {
    /// Returns true while a compaction or commit owns the volume.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Checking | Self::Compacting | Self::Committing)
    }
}

impl fmt::Display for VacuumPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Compacting => "compacting",
            Self::Compacted => "compacted",
            Self::Committing => "committing",
            Self::CleaningUp => "cleaning-up",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Progress of one compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct VacuumSession {
    /// Generation being compacted.
    pub source: Generation,
    /// Generation being written.
    pub destination: Generation,
    /// Garbage ratio when the compaction started.
    pub garbage_ratio: f64,
    /// Bytes of live records copied so far.
    pub processed_bytes: u64,
    /// Bytes of live records to copy.
    pub total_bytes: u64,
}

/// One progress sample yielded by a compaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactProgress {
    /// Bytes of live records copied so far.
    pub processed_bytes: u64,
    /// System 1-minute load average, or 0.0 where unavailable.
    pub load_avg_1m: f32,
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Whether the volume refuses writes after the commit.
    pub is_read_only: bool,
    /// Size of the committed data file.
    pub volume_size: u64,
}

#[derive(Debug, Default)]
pub(crate) struct VacuumState {
    pub(crate) phase: VacuumPhase,
    pub(crate) session: Option<VacuumSession>,
    /// Compacted generation waiting for commit.
    pub(crate) pending: Option<ActiveGeneration>,
}

impl VacuumState {
    pub(crate) fn new(phase: VacuumPhase) -> Self {
        Self {
            phase,
            session: None,
            pending: None,
        }
    }
}
