//! Core data model.
//!
//! A task is one persisted unit of work. Its state is never stored
//! explicitly: it is derived from the nullness of the `claimant` and
//! `output` columns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable task identifier, assigned by the store at enqueue and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a worker. Used as the `claimant` key and as the name of the
/// worker's scratch directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub i64);

impl WorkerId {
    /// Slots per process that [`for_slot`](Self::for_slot) keeps distinct.
    pub const MAX_SLOTS: usize = 1 << 16;

    /// Derive a worker id that is unique across processes sharing one store:
    /// the process id in the high bits, the worker's slot in the low bits.
    /// Slots at or above [`MAX_SLOTS`](Self::MAX_SLOTS) wrap around.
    pub fn for_slot(slot: usize) -> Self {
        let pid = i64::from(std::process::id());
        Self((pid << 16) | (slot % Self::MAX_SLOTS) as i64)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for a worker.
    Pending,
    /// Leased by a worker, no output yet.
    Claimed,
    /// Output recorded. Terminal until an administrative reset.
    Done,
}

impl State {
    /// Derive state from the stored columns. Output wins: once a result is
    /// recorded the claimant is ignored.
    pub fn from_columns(claimant: Option<i64>, has_output: bool) -> Self {
        match (claimant, has_output) {
            (_, true) => State::Done,
            (Some(_), false) => State::Claimed,
            (None, false) => State::Pending,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Claimed => "claimed",
            State::Done => "done",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Input files attached to a task: relative filename -> textual content.
pub type Files = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Leases and snapshots
// ---------------------------------------------------------------------------

/// A task handed to a worker by `claim_batch`, fully decoded.
#[derive(Debug, Clone)]
pub struct LeasedTask<T> {
    pub id: TaskId,
    pub payload: T,
    /// Empty when no files were attached.
    pub files: Files,
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub state: State,
    pub claimant: Option<WorkerId>,
}

/// Aggregate counts sampled from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub total: u64,
    pub claimed: u64,
    pub done: u64,
}

impl Counts {
    /// Tasks neither claimed nor done. Saturates because the three counts
    /// may be sampled at slightly different instants.
    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.claimed + self.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_determined_by_column_nullness() {
        assert_eq!(State::from_columns(None, false), State::Pending);
        assert_eq!(State::from_columns(Some(7), false), State::Claimed);
        assert_eq!(State::from_columns(None, true), State::Done);
        assert_eq!(State::from_columns(Some(7), true), State::Done);
    }

    #[test]
    fn worker_ids_differ_per_slot() {
        assert_ne!(WorkerId::for_slot(0), WorkerId::for_slot(1));
        assert_ne!(
            WorkerId::for_slot(0),
            WorkerId::for_slot(WorkerId::MAX_SLOTS - 1)
        );
    }

    #[test]
    fn pending_saturates_on_skewed_samples() {
        let counts = Counts {
            total: 3,
            claimed: 2,
            done: 2,
        };
        assert_eq!(counts.pending(), 0);
    }
}
