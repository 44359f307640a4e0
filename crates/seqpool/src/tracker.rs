//! The task tracker.
//!
//! The tracker mediates every task's admission, dispatch, and the process's
//! orderly shutdown. Producers announce work with [`TaskTracker::will_post_task`],
//! offer sequences with [`TaskTracker::will_schedule_sequence`], and workers
//! drain admitted sequences through [`TaskTracker::run_and_pop_next_task`].
//!
//! # Guarantees
//!
//! - Every admitted block-shutdown task runs to completion before
//!   [`TaskTracker::shutdown`] returns.
//! - Skip-on-shutdown tasks never start once shutdown has begun, but an
//!   already-running one holds shutdown open until it finishes.
//! - Continue-on-shutdown tasks never delay shutdown.
//! - At most `max_scheduled_best_effort_sequences` best-effort sequences are
//!   dispatched concurrently; earlier-posted work is preferred when the cap
//!   or the execution fence parks sequences.
//!
//! # Locking
//!
//! One scheduler lock guards the fence flag, the best-effort budget, and the
//! two preempted heaps. The shutdown latch and the flush/blocking-shutdown
//! counters are atomics on the fast path, in the packed-word layout
//! described below; the blocking waits (`shutdown`, `flush_for_testing`) use
//! a `Mutex` + `Condvar` pair each. Lock order is sequence transaction →
//! scheduler lock, and no lock is ever held across a task's closure.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::{self, ExecutorRegistry};
use crate::metrics::{self, MetricsSink, TracingMetricsSink};
use crate::policy::TaskPolicyScope;
use crate::preempted::{PreemptedEntry, PreemptedSequenceHeap};
use crate::sequence::{Sequence, SequenceTransaction};
use crate::task::{SequencedTime, ShutdownBehavior, Task, TaskPriority};

// ---------------------------------------------------------------------------
// Observer contract
// ---------------------------------------------------------------------------

/// Notified when a previously preempted sequence is cleared to run.
///
/// Invoked at most once per preemption, on an arbitrary thread. The sequence
/// reference is transferred to the observer, which must either run the
/// sequence or release it; the tracker does not follow up.
pub trait CanScheduleSequenceObserver: Send + Sync {
    /// The sequence may now be dispatched.
    fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>);
}

/// Phase of the shutdown state machine. Transitions are strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownState {
    /// Admissions and dispatch proceed normally.
    Running,
    /// `shutdown()` was called and is waiting for blocking tasks to drain.
    ShuttingDown,
    /// Every blocking task has completed; `shutdown()` has returned or is
    /// about to.
    ShutdownComplete,
}

// ---------------------------------------------------------------------------
// Packed shutdown word
// ---------------------------------------------------------------------------

const SHUTDOWN_STARTED_BIT: u64 = 1;
const TASKS_BLOCKING_UNIT: u64 = 1 << 1;

/// Bit 0: the one-way shutdown latch. Remaining bits: the number of tasks
/// currently entitled to hold shutdown open (admitted block-shutdown tasks,
/// plus skip-on-shutdown tasks for the duration of their run). Packing both
/// into one word lets increments observe the latch atomically.
struct ShutdownGate(AtomicU64);

impl ShutdownGate {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn has_shutdown_started(&self) -> bool {
        self.0.load(Ordering::Acquire) & SHUTDOWN_STARTED_BIT != 0
    }

    fn are_tasks_blocking_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire) >> 1 != 0
    }

    fn num_tasks_blocking_shutdown(&self) -> u64 {
        self.0.load(Ordering::Acquire) >> 1
    }

    /// Flip the latch. Returns whether tasks were blocking shutdown at that
    /// instant.
    fn start_shutdown(&self) -> bool {
        let previous = self.0.fetch_or(SHUTDOWN_STARTED_BIT, Ordering::AcqRel);
        assert!(
            previous & SHUTDOWN_STARTED_BIT == 0,
            "shutdown latch flipped twice"
        );
        previous >> 1 != 0
    }

    /// Returns whether shutdown had already started when the count went up.
    fn increment_tasks_blocking_shutdown(&self) -> bool {
        let previous = self.0.fetch_add(TASKS_BLOCKING_UNIT, Ordering::AcqRel);
        previous & SHUTDOWN_STARTED_BIT != 0
    }

    /// Returns whether shutdown has started and this decrement brought the
    /// count to zero -- i.e. whether the caller must complete shutdown.
    fn decrement_tasks_blocking_shutdown(&self) -> bool {
        let previous = self.0.fetch_sub(TASKS_BLOCKING_UNIT, Ordering::AcqRel);
        debug_assert!(previous >> 1 != 0, "blocking-shutdown count underflow");
        previous & SHUTDOWN_STARTED_BIT != 0 && previous >> 1 == 1
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FlushState {
    pending_callback: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct ShutdownSync {
    started: bool,
    complete: bool,
    num_block_shutdown_tasks_posted_during_shutdown: usize,
}

struct DispatchState {
    execution_fence_enabled: bool,
    num_scheduled_best_effort_sequences: usize,
    preempted_best_effort: PreemptedSequenceHeap,
    preempted_foreground: PreemptedSequenceHeap,
}

/// Oracle deciding whether a delayed task's delay has elapsed. The default
/// trusts the dispatcher: the external timer wheel only releases tasks whose
/// delay is over.
type DelayOracle = Box<dyn Fn(&Task) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// TaskTracker
// ---------------------------------------------------------------------------

/// Admission gate, dispatch gate, shutdown state machine, and flush
/// machinery for one pool of worker sequences.
pub struct TaskTracker {
    pool_label: String,
    max_scheduled_best_effort_sequences: usize,
    gate: ShutdownGate,
    num_incomplete_undelayed_tasks: AtomicUsize,
    sequenced_clock: AtomicU64,
    flush: Mutex<FlushState>,
    flush_cv: Condvar,
    shutdown_sync: Mutex<ShutdownSync>,
    shutdown_cv: Condvar,
    dispatch: Mutex<DispatchState>,
    delay_oracle: DelayOracle,
    metrics: Arc<dyn MetricsSink>,
}

impl TaskTracker {
    /// Tracker with an unbounded best-effort budget. The label only routes
    /// metrics.
    #[must_use]
    pub fn new(pool_label: impl Into<String>) -> Self {
        Self::with_best_effort_cap(pool_label, usize::MAX)
    }

    /// Tracker that dispatches at most `max` best-effort sequences
    /// concurrently. `max == 0` is legal: every best-effort sequence is
    /// parked until shutdown drains them.
    #[must_use]
    pub fn with_best_effort_cap(pool_label: impl Into<String>, max: usize) -> Self {
        Self {
            pool_label: pool_label.into(),
            max_scheduled_best_effort_sequences: max,
            gate: ShutdownGate::new(),
            num_incomplete_undelayed_tasks: AtomicUsize::new(0),
            sequenced_clock: AtomicU64::new(0),
            flush: Mutex::new(FlushState::default()),
            flush_cv: Condvar::new(),
            shutdown_sync: Mutex::new(ShutdownSync::default()),
            shutdown_cv: Condvar::new(),
            dispatch: Mutex::new(DispatchState {
                execution_fence_enabled: false,
                num_scheduled_best_effort_sequences: 0,
                preempted_best_effort: PreemptedSequenceHeap::new(),
                preempted_foreground: PreemptedSequenceHeap::new(),
            }),
            delay_oracle: Box::new(|_| true),
            metrics: Arc::new(TracingMetricsSink),
        }
    }

    /// Replace the delay oracle consulted at the run gate for delayed tasks.
    #[must_use]
    pub fn with_delay_oracle(
        mut self,
        oracle: impl Fn(&Task) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.delay_oracle = Box::new(oracle);
        self
    }

    /// Replace the latency metrics sink.
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// The pool label given at construction.
    #[must_use]
    pub fn pool_label(&self) -> &str {
        &self.pool_label
    }

    // -- Admission ----------------------------------------------------------

    /// Account for a task about to be posted. On `true` the task has been
    /// stamped with its sequenced-time and, if block-shutdown, the tracker
    /// guarantees it will run even after `shutdown()` is called. Returns
    /// `false` -- accounting nothing -- iff shutdown has started and the
    /// task does not (effectively) block shutdown.
    ///
    /// # Panics
    ///
    /// Panics if `task` was already admitted, or when called from within an
    /// executor registration.
    pub fn will_post_task(&self, task: &mut Task, behavior: ShutdownBehavior) -> bool {
        assert!(
            !executor::in_registration(),
            "tasks must not be posted from within executor registration"
        );
        ExecutorRegistry::global().freeze();

        let effective = behavior.effective_with_delay(!task.is_undelayed());
        if !self.before_post_task(effective) {
            tracing::debug!(
                pool = %self.pool_label,
                posted_from = %task.posted_from(),
                ?behavior,
                "task rejected: shutdown in progress"
            );
            return false;
        }

        if task.is_undelayed() {
            self.num_incomplete_undelayed_tasks
                .fetch_add(1, Ordering::Relaxed);
        }
        let stamp = SequencedTime(self.sequenced_clock.fetch_add(1, Ordering::Relaxed));
        task.mark_admitted(stamp);
        tracing::trace!(
            pool = %self.pool_label,
            posted_from = %task.posted_from(),
            ?behavior,
            sequenced_time = stamp.0,
            "task admitted"
        );
        true
    }

    /// Decide whether an admitted sequence may be dispatched right now.
    /// On `false` the sequence is parked in the matching preempted heap and
    /// `observer` will be notified exactly once when it is cleared to run.
    ///
    /// The transaction is taken by reference so the decision is atomic with
    /// respect to the sequence's front task.
    pub fn will_schedule_sequence(
        &self,
        transaction: &SequenceTransaction<'_>,
        observer: Option<Arc<dyn CanScheduleSequenceObserver>>,
    ) -> bool {
        let priority = transaction.priority();
        let mut dispatch = self.dispatch.lock().expect("scheduler lock poisoned");

        if self.gate.has_shutdown_started() {
            // Shutdown drains everything it admitted; parking now could
            // strand a block-shutdown task after the promotion pass already
            // ran.
            if priority == TaskPriority::BestEffort {
                dispatch.num_scheduled_best_effort_sequences += 1;
            }
            return true;
        }

        if dispatch.execution_fence_enabled {
            Self::park(&mut dispatch, transaction, observer, priority);
            return false;
        }

        if priority.is_foreground() {
            return true;
        }

        if dispatch.num_scheduled_best_effort_sequences
            < self.max_scheduled_best_effort_sequences
        {
            dispatch.num_scheduled_best_effort_sequences += 1;
            return true;
        }

        Self::park(&mut dispatch, transaction, observer, priority);
        false
    }

    fn park(
        dispatch: &mut DispatchState,
        transaction: &SequenceTransaction<'_>,
        observer: Option<Arc<dyn CanScheduleSequenceObserver>>,
        priority: TaskPriority,
    ) {
        let observer = observer.expect("sequence preempted without an observer");
        let sequenced_time = transaction
            .next_sequenced_time()
            .expect("cannot schedule an empty sequence");
        tracing::debug!(
            sequence = %transaction.token(),
            ?priority,
            sequenced_time = sequenced_time.0,
            "sequence preempted"
        );
        let heap = if priority.is_foreground() {
            &mut dispatch.preempted_foreground
        } else {
            &mut dispatch.preempted_best_effort
        };
        heap.insert(Arc::clone(transaction.sequence()), sequenced_time, observer);
    }

    // -- Dispatch -----------------------------------------------------------

    /// Pop the front task of an admitted `sequence`, run it if the run gate
    /// allows, and decide what happens to the sequence next.
    ///
    /// Returns the sequence when the caller should keep draining it; `None`
    /// when the sequence is empty or was parked again (in which case the
    /// observer owed a wake-up has been recorded). Whenever this call frees
    /// best-effort budget, exactly one parked best-effort sequence is
    /// promoted and its observer notified before returning.
    ///
    /// # Panics
    ///
    /// Panics if `sequence` is empty; a panic from the task's closure
    /// propagates after the counters are restored.
    pub fn run_and_pop_next_task(
        &self,
        sequence: Arc<Sequence>,
        observer: Option<Arc<dyn CanScheduleSequenceObserver>>,
    ) -> Option<Arc<Sequence>> {
        let (task, priority) = {
            let mut transaction = sequence.begin_transaction();
            (transaction.pop_front(), transaction.priority())
        };
        let traits = sequence.traits().clone();
        let behavior = traits
            .shutdown_behavior()
            .effective_with_delay(!task.is_undelayed());
        let can_run = self.before_run_task(behavior, &task);

        {
            // Dropped on every exit path, including a panicking closure, so
            // a failing task cannot wedge shutdown or flush.
            let _accounting = TaskAccountingGuard {
                tracker: self,
                behavior,
                ran: can_run,
                undelayed: task.is_undelayed(),
            };

            if can_run {
                let histogram = metrics::task_latency_histogram_name(
                    &self.pool_label,
                    priority,
                    traits.allows_blocking() || traits.allows_sync_primitives(),
                );
                self.metrics
                    .record_histogram(&histogram, task.latency_micros());
                tracing::debug!(
                    pool = %self.pool_label,
                    sequence = %sequence.token(),
                    posted_from = %task.posted_from(),
                    "running task"
                );
                let _scope = TaskPolicyScope::install(&sequence, &task);
                (task.into_closure())();
            } else {
                tracing::debug!(
                    pool = %self.pool_label,
                    sequence = %sequence.token(),
                    posted_from = %task.posted_from(),
                    ?behavior,
                    "dropping task at run gate"
                );
                drop(task);
            }
        }

        let next_sequenced_time = sequence.begin_transaction().next_sequenced_time();
        if priority == TaskPriority::BestEffort {
            self.manage_best_effort_after_run(sequence, next_sequenced_time, observer)
        } else {
            match next_sequenced_time {
                None => None,
                Some(next_time) => self.reschedule_foreground(sequence, next_time, observer),
            }
        }
    }

    /// Run gate. Skip-on-shutdown tasks start holding shutdown open here;
    /// the increment is backed out immediately when the gate refuses them.
    fn before_run_task(&self, behavior: ShutdownBehavior, task: &Task) -> bool {
        let delay_elapsed = task.is_undelayed() || (self.delay_oracle)(task);
        match behavior {
            ShutdownBehavior::BlockShutdown => {
                // Counted since admission; shutdown is waiting on this task.
                debug_assert!(self.gate.are_tasks_blocking_shutdown());
                debug_assert!(
                    !self.is_shutdown_complete(),
                    "block-shutdown task dispatched after shutdown completed"
                );
                true
            }
            ShutdownBehavior::SkipOnShutdown => {
                let shutdown_started = self.gate.increment_tasks_blocking_shutdown();
                if shutdown_started || !delay_elapsed {
                    if self.gate.decrement_tasks_blocking_shutdown() {
                        self.on_blocking_shutdown_tasks_complete();
                    }
                    return false;
                }
                true
            }
            ShutdownBehavior::ContinueOnShutdown => {
                !self.gate.has_shutdown_started() && delay_elapsed
            }
        }
    }

    fn before_post_task(&self, effective_behavior: ShutdownBehavior) -> bool {
        if effective_behavior == ShutdownBehavior::BlockShutdown {
            // Block-shutdown tasks hold shutdown open from admission to
            // completion.
            let shutdown_started = self.gate.increment_tasks_blocking_shutdown();
            if shutdown_started {
                let mut sync = self.shutdown_sync.lock().expect("shutdown lock poisoned");
                if sync.complete {
                    // Nothing can wait for this task anymore; an ordering
                    // bug upstream.
                    drop(sync);
                    debug_assert!(
                        false,
                        "block-shutdown task posted after shutdown completed"
                    );
                    if self.gate.decrement_tasks_blocking_shutdown() {
                        self.on_blocking_shutdown_tasks_complete();
                    }
                    return false;
                }
                sync.num_block_shutdown_tasks_posted_during_shutdown += 1;
            }
            return true;
        }
        !self.gate.has_shutdown_started()
    }

    /// Decide the fate of a best-effort sequence after one of its tasks ran.
    /// The budget slot is kept when the sequence continues draining,
    /// otherwise released to the earliest parked sequence.
    fn manage_best_effort_after_run(
        &self,
        sequence: Arc<Sequence>,
        next_sequenced_time: Option<SequencedTime>,
        observer: Option<Arc<dyn CanScheduleSequenceObserver>>,
    ) -> Option<Arc<Sequence>> {
        let mut promoted: Option<PreemptedEntry> = None;
        let rescheduled = {
            let mut dispatch = self.dispatch.lock().expect("scheduler lock poisoned");
            let shutdown_started = self.gate.has_shutdown_started();

            let keep_draining = match next_sequenced_time {
                None => false,
                Some(next_time) => {
                    if shutdown_started {
                        true
                    } else if dispatch.execution_fence_enabled {
                        false
                    } else {
                        // Yield the slot only to a strictly earlier parked
                        // sequence.
                        dispatch
                            .preempted_best_effort
                            .min_sequenced_time()
                            .is_none_or(|parked| parked >= next_time)
                    }
                }
            };

            if keep_draining {
                Some(sequence)
            } else {
                if let Some(next_time) = next_sequenced_time {
                    let observer =
                        observer.expect("sequence preempted without an observer");
                    tracing::debug!(
                        sequence = %sequence.token(),
                        sequenced_time = next_time.0,
                        "best-effort sequence re-preempted"
                    );
                    dispatch
                        .preempted_best_effort
                        .insert(sequence, next_time, observer);
                }
                dispatch.num_scheduled_best_effort_sequences -= 1;
                let may_promote = shutdown_started
                    || (!dispatch.execution_fence_enabled
                        && dispatch.num_scheduled_best_effort_sequences
                            < self.max_scheduled_best_effort_sequences);
                if may_promote {
                    if let Some(entry) = dispatch.preempted_best_effort.pop_min() {
                        dispatch.num_scheduled_best_effort_sequences += 1;
                        promoted = Some(entry);
                    }
                }
                None
            }
        };

        if let Some(entry) = promoted {
            tracing::debug!(
                sequence = %entry.sequence.token(),
                "parked best-effort sequence promoted"
            );
            entry
                .observer
                .on_can_schedule_sequence(Arc::clone(&entry.sequence));
        }
        rescheduled
    }

    fn reschedule_foreground(
        &self,
        sequence: Arc<Sequence>,
        next_time: SequencedTime,
        observer: Option<Arc<dyn CanScheduleSequenceObserver>>,
    ) -> Option<Arc<Sequence>> {
        let mut dispatch = self.dispatch.lock().expect("scheduler lock poisoned");
        if dispatch.execution_fence_enabled && !self.gate.has_shutdown_started() {
            let observer = observer.expect("sequence preempted without an observer");
            tracing::debug!(
                sequence = %sequence.token(),
                "foreground sequence parked behind the fence"
            );
            dispatch
                .preempted_foreground
                .insert(sequence, next_time, observer);
            None
        } else {
            Some(sequence)
        }
    }

    // -- Shutdown -----------------------------------------------------------

    /// Transition to *shutting-down*, promote every parked sequence, and
    /// block until all tasks entitled to hold shutdown open have completed.
    ///
    /// # Panics
    ///
    /// Panics when called more than once.
    pub fn shutdown(&self) {
        tracing::info!(pool = %self.pool_label, "shutdown started");
        let tasks_blocking = {
            let mut sync = self.shutdown_sync.lock().expect("shutdown lock poisoned");
            assert!(!sync.started, "shutdown() called twice");
            sync.started = true;
            let blocking = self.gate.start_shutdown();
            if !blocking {
                sync.complete = true;
                self.shutdown_cv.notify_all();
            }
            blocking
        };

        // Shutdown start satisfies the flush condition.
        self.wake_flush_waiters();

        // Promote parked sequences so admitted block-shutdown work can
        // drain; the cap no longer applies. Observers run on this thread and
        // may dispatch inline.
        let promoted = {
            let mut dispatch = self.dispatch.lock().expect("scheduler lock poisoned");
            if !dispatch.preempted_best_effort.is_empty()
                || !dispatch.preempted_foreground.is_empty()
            {
                tracing::debug!(
                    best_effort = dispatch.preempted_best_effort.len(),
                    foreground = dispatch.preempted_foreground.len(),
                    "promoting parked sequences for shutdown"
                );
            }
            let mut entries = Vec::new();
            while let Some(entry) = dispatch.preempted_best_effort.pop_min() {
                dispatch.num_scheduled_best_effort_sequences += 1;
                entries.push(entry);
            }
            while let Some(entry) = dispatch.preempted_foreground.pop_min() {
                entries.push(entry);
            }
            entries
        };
        for entry in promoted {
            tracing::debug!(
                sequence = %entry.sequence.token(),
                "promoting parked sequence for shutdown"
            );
            entry
                .observer
                .on_can_schedule_sequence(Arc::clone(&entry.sequence));
        }

        if tasks_blocking {
            let mut sync = self.shutdown_sync.lock().expect("shutdown lock poisoned");
            while !sync.complete {
                sync = self
                    .shutdown_cv
                    .wait(sync)
                    .expect("shutdown lock poisoned");
            }
        }

        let late_posts = self
            .shutdown_sync
            .lock()
            .expect("shutdown lock poisoned")
            .num_block_shutdown_tasks_posted_during_shutdown;
        tracing::info!(
            pool = %self.pool_label,
            late_block_shutdown_posts = late_posts,
            "shutdown complete"
        );
    }

    /// Whether `shutdown()` has been entered.
    #[must_use]
    pub fn has_shutdown_started(&self) -> bool {
        self.gate.has_shutdown_started()
    }

    /// Whether every task entitled to hold shutdown open has completed.
    #[must_use]
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_sync
            .lock()
            .expect("shutdown lock poisoned")
            .complete
    }

    /// Current phase of the shutdown state machine.
    #[must_use]
    pub fn shutdown_state(&self) -> ShutdownState {
        if self.is_shutdown_complete() {
            ShutdownState::ShutdownComplete
        } else if self.gate.has_shutdown_started() {
            ShutdownState::ShuttingDown
        } else {
            ShutdownState::Running
        }
    }

    fn on_blocking_shutdown_tasks_complete(&self) {
        let mut sync = self.shutdown_sync.lock().expect("shutdown lock poisoned");
        // A racing block-shutdown post may have re-raised the count between
        // the final decrement and here; the word is authoritative under this
        // lock.
        if self.gate.num_tasks_blocking_shutdown() != 0 {
            return;
        }
        sync.complete = true;
        self.shutdown_cv.notify_all();
    }

    // -- Fence --------------------------------------------------------------

    /// Turn the execution fence on or off. While on, every would-be-admitted
    /// sequence parks in the matching heap and running sequences park at
    /// their next reschedule point; turning it off drains the heaps,
    /// best-effort first up to the cap, then foreground without limit.
    /// Toggling to the current state is a no-op.
    pub fn set_execution_fence_enabled(&self, enabled: bool) {
        let mut promoted = Vec::new();
        {
            let mut dispatch = self.dispatch.lock().expect("scheduler lock poisoned");
            if dispatch.execution_fence_enabled == enabled {
                return;
            }
            dispatch.execution_fence_enabled = enabled;
            tracing::info!(pool = %self.pool_label, enabled, "execution fence toggled");
            if enabled {
                return;
            }

            while dispatch.num_scheduled_best_effort_sequences
                < self.max_scheduled_best_effort_sequences
            {
                match dispatch.preempted_best_effort.pop_min() {
                    Some(entry) => {
                        dispatch.num_scheduled_best_effort_sequences += 1;
                        promoted.push(entry);
                    }
                    None => break,
                }
            }
            while let Some(entry) = dispatch.preempted_foreground.pop_min() {
                promoted.push(entry);
            }
        }

        for entry in promoted {
            tracing::debug!(
                sequence = %entry.sequence.token(),
                "parked sequence promoted after fence release"
            );
            entry
                .observer
                .on_can_schedule_sequence(Arc::clone(&entry.sequence));
        }
    }

    // -- Flush --------------------------------------------------------------

    /// Block until every posted undelayed task has completed or shutdown has
    /// started. Returns immediately when neither wait is needed.
    pub fn flush_for_testing(&self) {
        let mut flush = self.flush.lock().expect("flush lock poisoned");
        while self.num_incomplete_undelayed_tasks.load(Ordering::Acquire) != 0
            && !self.gate.has_shutdown_started()
        {
            flush = self.flush_cv.wait(flush).expect("flush lock poisoned");
        }
    }

    /// Invoke `callback` exactly once, from an arbitrary thread, when every
    /// posted undelayed task has completed or shutdown has started. Invoked
    /// synchronously when the condition already holds.
    ///
    /// # Panics
    ///
    /// Panics if an async flush is already pending.
    pub fn flush_async_for_testing(&self, callback: Box<dyn FnOnce() + Send>) {
        let ready = {
            let mut flush = self.flush.lock().expect("flush lock poisoned");
            assert!(
                flush.pending_callback.is_none(),
                "only one pending async flush is allowed"
            );
            flush.pending_callback = Some(callback);
            if self.num_incomplete_undelayed_tasks.load(Ordering::Acquire) == 0
                || self.gate.has_shutdown_started()
            {
                flush.pending_callback.take()
            } else {
                None
            }
        };
        if let Some(callback) = ready {
            callback();
        }
    }

    fn decrement_num_incomplete_undelayed_tasks(&self) {
        let previous = self
            .num_incomplete_undelayed_tasks
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "undelayed-task count underflow");
        if previous == 1 {
            self.wake_flush_waiters();
        }
    }

    fn wake_flush_waiters(&self) {
        let callback = {
            let mut flush = self.flush.lock().expect("flush lock poisoned");
            self.flush_cv.notify_all();
            flush.pending_callback.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    // -- Introspection ------------------------------------------------------

    /// Number of sequences currently parked for the given priority class.
    #[must_use]
    pub fn preempted_sequence_count_for_testing(&self, priority: TaskPriority) -> usize {
        let dispatch = self.dispatch.lock().expect("scheduler lock poisoned");
        if priority.is_foreground() {
            dispatch.preempted_foreground.len()
        } else {
            dispatch.preempted_best_effort.len()
        }
    }

    /// Point-in-time snapshot of the tracker's counters.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        let dispatch = self.dispatch.lock().expect("scheduler lock poisoned");
        TrackerStats {
            pool_label: self.pool_label.clone(),
            shutdown_state: self.shutdown_state(),
            num_incomplete_undelayed_tasks: self
                .num_incomplete_undelayed_tasks
                .load(Ordering::Acquire),
            num_tasks_blocking_shutdown: self.gate.num_tasks_blocking_shutdown(),
            num_scheduled_best_effort_sequences: dispatch.num_scheduled_best_effort_sequences,
            preempted_best_effort_sequences: dispatch.preempted_best_effort.len(),
            preempted_foreground_sequences: dispatch.preempted_foreground.len(),
            execution_fence_enabled: dispatch.execution_fence_enabled,
            captured_at: Utc::now(),
        }
    }
}

impl fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTracker")
            .field("pool_label", &self.pool_label)
            .field("shutdown_state", &self.shutdown_state())
            .field(
                "num_incomplete_undelayed_tasks",
                &self.num_incomplete_undelayed_tasks.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Snapshot of tracker counters, serializable for diagnostics endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerStats {
    /// Label given at construction; routes metrics.
    pub pool_label: String,
    /// Phase of the shutdown state machine.
    pub shutdown_state: ShutdownState,
    /// Posted-but-not-run tasks with no delay.
    pub num_incomplete_undelayed_tasks: usize,
    /// Tasks currently entitled to hold shutdown open.
    pub num_tasks_blocking_shutdown: u64,
    /// Best-effort sequences currently dispatched.
    pub num_scheduled_best_effort_sequences: usize,
    /// Best-effort sequences parked by the cap or the fence.
    pub preempted_best_effort_sequences: usize,
    /// Foreground sequences parked by the fence.
    pub preempted_foreground_sequences: usize,
    /// Whether the execution fence is on.
    pub execution_fence_enabled: bool,
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run accounting
// ---------------------------------------------------------------------------

/// Restores the flush and blocking-shutdown counters after a task runs or is
/// dropped at the gate. Lives across the closure so a panicking task still
/// releases its accounting while the panic propagates.
struct TaskAccountingGuard<'a> {
    tracker: &'a TaskTracker,
    behavior: ShutdownBehavior,
    ran: bool,
    undelayed: bool,
}

impl Drop for TaskAccountingGuard<'_> {
    fn drop(&mut self) {
        match self.behavior {
            ShutdownBehavior::BlockShutdown => {
                if self.tracker.gate.decrement_tasks_blocking_shutdown() {
                    self.tracker.on_blocking_shutdown_tasks_complete();
                }
            }
            // Only a skip task that actually ran took a count at the gate.
            ShutdownBehavior::SkipOnShutdown if self.ran => {
                if self.tracker.gate.decrement_tasks_blocking_shutdown() {
                    self.tracker.on_blocking_shutdown_tasks_complete();
                }
            }
            _ => {}
        }
        if self.undelayed {
            self.tracker.decrement_num_incomplete_undelayed_tasks();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
