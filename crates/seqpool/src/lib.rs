//! SeqPool core.
//!
//! This crate is the heart of an in-process task scheduler: the machinery
//! that sits between task producers (who post closures tagged with traits)
//! and a pool of worker sequences (which dequeue and run them):
//!
//! - **[`tracker`]** -- The [`TaskTracker`]: admission, dispatch gating, the
//!   best-effort concurrency cap, the execution fence, the shutdown state
//!   machine, and test-only flush.
//! - **[`sequence`]** -- Ordered, single-consumer task queues with
//!   per-sequence transactions.
//! - **[`task`]** -- [`Task`] records and the [`TaskTraits`] hint bundle.
//! - **[`policy`]** -- Thread-local policy installed around every task run:
//!   current sequence token, runner handles, and the blocking/sync/singleton
//!   permission bits.
//! - **[`executor`]** -- Process-wide registry of alternative executors for
//!   extension-routed tasks, backed by [`DashMap`](dashmap::DashMap).
//! - **[`runner`]** -- The task-runner traits that concrete pools implement.
//! - **[`metrics`]** -- Per-task latency histograms.
//! - **[`error`]** -- Unified error types via [`thiserror`].
//!
//! All public types are `Send + Sync`. Workers, producers, and the thread
//! calling [`TaskTracker::shutdown`] may live on any mix of threads.

pub mod error;
pub mod executor;
pub mod metrics;
pub mod policy;
mod preempted;
pub mod runner;
pub mod sequence;
pub mod task;
pub mod tracker;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{Result, TrackerError};
pub use executor::{ExecutorRegistry, TaskExecutor};
pub use metrics::{MetricsSink, TracingMetricsSink};
pub use policy::ScopedPriorityOverride;
pub use runner::{SequencedTaskRunner, SingleThreadTaskRunner};
pub use sequence::{Sequence, SequenceToken, SequenceTransaction};
pub use task::{
    ExtensionId, SequencedTime, ShutdownBehavior, Task, TaskFn, TaskPriority, TaskTraits,
};
pub use tracker::{
    CanScheduleSequenceObserver, ShutdownState, TaskTracker, TrackerStats,
};
