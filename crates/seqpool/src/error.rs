//! Tracker error types.
//!
//! Admission refusals are *not* errors -- `will_post_task` and
//! `will_schedule_sequence` report them as `false` and callers are expected
//! to handle both outcomes. Contract violations (a second `shutdown()`, a
//! doubled async flush, re-posting an admitted task record) are programming
//! errors and panic with a diagnostic. [`TrackerError`] covers the remaining
//! genuinely fallible surface: thread-local queries that are only valid
//! during the dynamic extent of a task's execution.

use crate::sequence::SequenceToken;

/// Unified error type for the seqpool core.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// A thread-local query (`current_sequence_token`, a runner handle) was
    /// made outside of a running task.
    #[error("no task is running on the current thread")]
    NotInTask,

    /// The running task's sequence has no task-runner back-reference, or the
    /// runner it referenced has been destroyed.
    #[error("no task runner handle is installed for sequence {sequence}")]
    NoRunnerHandle {
        /// Token of the sequence whose task is currently running.
        sequence: SequenceToken,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrackerError>;
