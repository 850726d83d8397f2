//! Periodic checkpoint overhead
//!
//! A checkpointing server pays `time_ticks` of non-productive execution every
//! time its cumulative productive run time reaches a multiple of
//! `wait_ticks`. The overhead is inserted serially before productive
//! execution resumes, so relative to a checkpoint-free run, completion moves
//! out by `time_ticks * floor(productive / wait_ticks)`. Checkpoint overhead
//! keeps the server's flow demand alive but contributes zero progress.

use serde::{Deserialize, Serialize};

/// Checkpoint cadence parameters for one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    /// Productive ticks between checkpoints
    pub wait_ticks: u64,
    /// Non-productive ticks paid per checkpoint
    pub time_ticks: u64,
}

impl CheckpointPolicy {
    pub fn new(wait_ticks: u64, time_ticks: u64) -> Self {
        CheckpointPolicy {
            wait_ticks,
            time_ticks,
        }
    }

    /// Next productive-runtime value at which a checkpoint is due.
    ///
    /// Always strictly ahead of `productive_ticks`: a boundary that was
    /// already paid (or interrupted) is never revisited.
    pub fn next_boundary(&self, productive_ticks: u64) -> u64 {
        (productive_ticks / self.wait_ticks + 1) * self.wait_ticks
    }

    /// Total overhead a run accrues over `productive_ticks` of progress
    pub fn overhead_for(&self, productive_ticks: u64) -> u64 {
        self.time_ticks * (productive_ticks / self.wait_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_boundary_is_strictly_ahead() {
        let policy = CheckpointPolicy::new(30, 5);

        assert_eq!(policy.next_boundary(0), 30);
        assert_eq!(policy.next_boundary(29), 30);
        // Exactly on a boundary means that one was already taken
        assert_eq!(policy.next_boundary(30), 60);
        assert_eq!(policy.next_boundary(31), 60);
    }

    #[test]
    fn test_overhead_matches_floor_formula() {
        let policy = CheckpointPolicy::new(30, 5);

        assert_eq!(policy.overhead_for(0), 0);
        assert_eq!(policy.overhead_for(29), 0);
        assert_eq!(policy.overhead_for(30), 5);
        assert_eq!(policy.overhead_for(100), 15);

        // A run ending exactly on a boundary still pays that checkpoint
        assert_eq!(policy.overhead_for(60), 10);
    }
}
