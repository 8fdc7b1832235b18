//! Job state machine for the queue.

use serde::{Deserialize, Serialize};

/// Job state.
///
/// State transitions:
/// - Waiting -> Active -> Completed
/// - Delayed -> Waiting (delay elapsed)
/// - Active -> Delayed -> Waiting (failed, backoff before next attempt)
/// - Active -> Failed (attempts exhausted; retained unless remove_on_fail)
/// - Failed -> Waiting (explicit retry)
/// - Active -> Waiting (lease expired; the job will be delivered again)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to run immediately.
    Waiting,

    /// Not eligible until its run time (initial delay or retry backoff).
    Delayed,

    /// Leased by a worker.
    Active,

    Completed,

    /// Attempts exhausted.
    Failed,
}

impl JobState {
    pub fn is_runnable(self) -> bool {
        matches!(self, JobState::Waiting)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}
