//! Tasks and their traits.
//!
//! A [`Task`] is an immutable record of a posted closure: where it was
//! posted from, how long it wanted to wait before running, and -- once the
//! tracker has admitted it -- the sequenced-time stamp that orders it
//! against every other admitted task. [`TaskTraits`] is the bundle of hints
//! a producer attaches to its work: priority class, shutdown behavior, and
//! whether the closure is allowed to block or wait on synchronization
//! primitives.

use std::any::Any;
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy;
use crate::runner::{SequencedTaskRunner, SingleThreadTaskRunner};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The closure a worker will execute on the task's behalf.
pub type TaskFn = Box<dyn FnOnce() + Send>;

/// Priority class that determines how eagerly a task's sequence is
/// dispatched. `BestEffort` is "background"; the other two are "foreground".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    /// Background work subject to the tracker's concurrency cap.
    BestEffort = 0,
    /// Default priority; the user sees the effect but is not waiting on it.
    UserVisible = 1,
    /// The user is actively waiting on this work.
    UserBlocking = 2,
}

impl TaskPriority {
    /// Whether this class is dispatched without consulting the best-effort
    /// concurrency cap.
    #[must_use]
    pub fn is_foreground(self) -> bool {
        self != Self::BestEffort
    }
}

/// What happens to a task when process shutdown starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShutdownBehavior {
    /// The task may keep running concurrently with shutdown; shutdown does
    /// not wait for it, and it must not start once shutdown has begun.
    ContinueOnShutdown,
    /// The task never starts once shutdown has begun, but shutdown waits for
    /// it if it is already mid-flight.
    #[default]
    SkipOnShutdown,
    /// The task is guaranteed to run to completion before shutdown returns.
    BlockShutdown,
}

impl ShutdownBehavior {
    /// The behavior the tracker actually accounts for. A delayed task never
    /// blocks shutdown regardless of its tag, so a delayed `BlockShutdown`
    /// task is handled as `SkipOnShutdown`.
    pub(crate) fn effective_with_delay(self, delayed: bool) -> Self {
        if delayed && self == Self::BlockShutdown {
            Self::SkipOnShutdown
        } else {
            self
        }
    }
}

/// Identifier routing a task to an alternative executor registered in the
/// [`crate::executor::ExecutorRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtensionId(pub u8);

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical admission stamp. Assigned exactly once, at admission, from the
/// tracker's monotonic clock; a sequence is ordered by its front task's
/// stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequencedTime(pub(crate) u64);

// ---------------------------------------------------------------------------
// Task traits
// ---------------------------------------------------------------------------

/// Immutable bundle of hints attached to posted work.
///
/// Built with chained setters:
///
/// ```rust
/// # use seqpool::{TaskTraits, TaskPriority, ShutdownBehavior};
/// let traits = TaskTraits::new()
///     .with_priority(TaskPriority::BestEffort)
///     .with_shutdown_behavior(ShutdownBehavior::BlockShutdown)
///     .may_block();
/// assert_eq!(traits.priority(), TaskPriority::BestEffort);
/// ```
#[derive(Clone, Default)]
pub struct TaskTraits {
    priority: Option<TaskPriority>,
    shutdown_behavior: ShutdownBehavior,
    may_block: bool,
    with_base_sync_primitives: bool,
    extension_id: Option<ExtensionId>,
    extension_payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl TaskTraits {
    /// Trait bundle with every recognized option at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit priority class.
    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the shutdown behavior. Defaults to [`ShutdownBehavior::SkipOnShutdown`].
    #[must_use]
    pub fn with_shutdown_behavior(mut self, behavior: ShutdownBehavior) -> Self {
        self.shutdown_behavior = behavior;
        self
    }

    /// Allow the task to perform blocking I/O.
    #[must_use]
    pub fn may_block(mut self) -> Self {
        self.may_block = true;
        self
    }

    /// Allow the task to wait on synchronization primitives.
    #[must_use]
    pub fn with_base_sync_primitives(mut self) -> Self {
        self.with_base_sync_primitives = true;
        self
    }

    /// Route the task to the alternative executor registered under `id`,
    /// with an opaque payload the executor interprets.
    #[must_use]
    pub fn with_extension(
        mut self,
        id: ExtensionId,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        self.extension_id = Some(id);
        self.extension_payload = Some(payload);
        self
    }

    /// The effective priority class: the explicit one if set, otherwise the
    /// posting thread's scoped override, otherwise
    /// [`TaskPriority::UserVisible`].
    #[must_use]
    pub fn priority(&self) -> TaskPriority {
        self.priority
            .or_else(policy::current_priority_override)
            .unwrap_or(TaskPriority::UserVisible)
    }

    /// The declared shutdown behavior.
    #[must_use]
    pub fn shutdown_behavior(&self) -> ShutdownBehavior {
        self.shutdown_behavior
    }

    /// Whether the task may perform blocking I/O.
    #[must_use]
    pub fn allows_blocking(&self) -> bool {
        self.may_block
    }

    /// Whether the task may wait on synchronization primitives.
    #[must_use]
    pub fn allows_sync_primitives(&self) -> bool {
        self.with_base_sync_primitives
    }

    /// The extension executor id, if the task is routed.
    #[must_use]
    pub fn extension_id(&self) -> Option<ExtensionId> {
        self.extension_id
    }

    /// The opaque payload attached alongside the extension id.
    #[must_use]
    pub fn extension_payload(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.extension_payload.as_ref()
    }
}

impl fmt::Debug for TaskTraits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTraits")
            .field("priority", &self.priority)
            .field("shutdown_behavior", &self.shutdown_behavior)
            .field("may_block", &self.may_block)
            .field("with_base_sync_primitives", &self.with_base_sync_primitives)
            .field("extension_id", &self.extension_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A posted unit of work.
///
/// The record is move-only: it is owned by its sequence from admission until
/// a worker pops it, at which point ownership transfers to the worker and
/// the record is consumed when the closure runs (or is dropped unexecuted at
/// the run gate).
pub struct Task {
    posted_from: &'static Location<'static>,
    closure: TaskFn,
    delay: Duration,
    sequenced_time: Option<SequencedTime>,
    posted_at: Option<DateTime<Utc>>,
    admitted_at: Option<Instant>,
    sequenced_runner_ref: Option<Weak<dyn SequencedTaskRunner>>,
    single_thread_runner_ref: Option<Weak<dyn SingleThreadTaskRunner>>,
}

impl Task {
    /// Create an undelayed task from a closure. The posting source location
    /// is captured from the caller for diagnostics.
    #[track_caller]
    pub fn new(closure: impl FnOnce() + Send + 'static) -> Self {
        Self::with_delay(closure, Duration::ZERO)
    }

    /// Create a task that wants to wait `delay` before running. Delay
    /// elapsing is the business of the external timer wheel; the tracker
    /// only consults its delay oracle at the run gate.
    #[track_caller]
    pub fn with_delay(closure: impl FnOnce() + Send + 'static, delay: Duration) -> Self {
        Self {
            posted_from: Location::caller(),
            closure: Box::new(closure),
            delay,
            sequenced_time: None,
            posted_at: None,
            admitted_at: None,
            sequenced_runner_ref: None,
            single_thread_runner_ref: None,
        }
    }

    /// Source location the task was created at.
    #[must_use]
    pub fn posted_from(&self) -> &'static Location<'static> {
        self.posted_from
    }

    /// The requested delay before the task may run.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether the task has no delay. Only undelayed tasks participate in
    /// flush accounting.
    #[must_use]
    pub fn is_undelayed(&self) -> bool {
        self.delay.is_zero()
    }

    /// The admission stamp, if the task has been admitted.
    #[must_use]
    pub fn sequenced_time(&self) -> Option<SequencedTime> {
        self.sequenced_time
    }

    /// Wall-clock time of admission, for diagnostics.
    #[must_use]
    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        self.posted_at
    }

    /// Attach a non-owning back-reference to the sequenced task runner that
    /// posted this task, so the runner handle is visible from within the
    /// task's execution.
    pub fn set_sequenced_runner(&mut self, runner: Weak<dyn SequencedTaskRunner>) {
        self.sequenced_runner_ref = Some(runner);
    }

    /// Attach a non-owning back-reference to the single-thread task runner
    /// that posted this task.
    pub fn set_single_thread_runner(&mut self, runner: Weak<dyn SingleThreadTaskRunner>) {
        self.single_thread_runner_ref = Some(runner);
    }

    pub(crate) fn sequenced_runner_ref(&self) -> Option<&Weak<dyn SequencedTaskRunner>> {
        self.sequenced_runner_ref.as_ref()
    }

    pub(crate) fn single_thread_runner_ref(&self) -> Option<&Weak<dyn SingleThreadTaskRunner>> {
        self.single_thread_runner_ref.as_ref()
    }

    /// Stamp the task at admission. Re-posting an already-admitted record is
    /// a contract violation.
    pub(crate) fn mark_admitted(&mut self, time: SequencedTime) {
        assert!(
            self.sequenced_time.is_none(),
            "task posted from {} was already admitted",
            self.posted_from
        );
        self.sequenced_time = Some(time);
        self.posted_at = Some(Utc::now());
        self.admitted_at = Some(Instant::now());
    }

    /// Microseconds between admission and now, for the latency histogram.
    pub(crate) fn latency_micros(&self) -> u64 {
        self.admitted_at
            .map(|at| u64::try_from(at.elapsed().as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Consume the record and return the closure to execute.
    pub(crate) fn into_closure(self) -> TaskFn {
        self.closure
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("posted_from", &format_args!("{}", self.posted_from))
            .field("delay", &self.delay)
            .field("sequenced_time", &self.sequenced_time)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let traits = TaskTraits::new();
        assert_eq!(traits.priority(), TaskPriority::UserVisible);
        assert_eq!(traits.shutdown_behavior(), ShutdownBehavior::SkipOnShutdown);
        assert!(!traits.allows_blocking());
        assert!(!traits.allows_sync_primitives());
        assert!(traits.extension_id().is_none());
    }

    #[test]
    fn priority_classes() {
        assert!(!TaskPriority::BestEffort.is_foreground());
        assert!(TaskPriority::UserVisible.is_foreground());
        assert!(TaskPriority::UserBlocking.is_foreground());
    }

    #[test]
    fn delayed_block_shutdown_is_effectively_skip() {
        let behavior = ShutdownBehavior::BlockShutdown;
        assert_eq!(
            behavior.effective_with_delay(true),
            ShutdownBehavior::SkipOnShutdown
        );
        assert_eq!(
            behavior.effective_with_delay(false),
            ShutdownBehavior::BlockShutdown
        );
        // The other behaviors are unaffected by delay.
        assert_eq!(
            ShutdownBehavior::ContinueOnShutdown.effective_with_delay(true),
            ShutdownBehavior::ContinueOnShutdown
        );
    }

    #[test]
    fn admission_stamps_once() {
        let mut task = Task::new(|| {});
        assert!(task.sequenced_time().is_none());
        assert!(task.posted_at().is_none());

        task.mark_admitted(SequencedTime(7));
        assert_eq!(task.sequenced_time(), Some(SequencedTime(7)));
        assert!(task.posted_at().is_some());
    }

    #[test]
    #[should_panic(expected = "already admitted")]
    fn double_admission_panics() {
        let mut task = Task::new(|| {});
        task.mark_admitted(SequencedTime(1));
        task.mark_admitted(SequencedTime(2));
    }

    #[test]
    fn posted_location_is_captured() {
        let task = Task::new(|| {});
        assert!(task.posted_from().file().ends_with("task.rs"));
    }

    #[test]
    fn closure_runs_when_consumed() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let task = Task::new(move || flag.store(true, Ordering::SeqCst));

        (task.into_closure())();
        assert!(ran.load(Ordering::SeqCst));
    }
}
