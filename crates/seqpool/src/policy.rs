//! Thread-local task policy.
//!
//! Before a worker runs a task, a stack-allocated [`TaskPolicyScope`]
//! installs on the calling thread: the sequence's token, the task-runner
//! back-references as "current runner" handles, and the permission bits
//! derived from the task's traits (blocking I/O, synchronization primitives,
//! singleton access). The scope restores the previous state on every exit
//! path, including unwinding, so nested tasks on one thread see properly
//! nested scopes and a panicking task cannot leak its policy onto the next.
//!
//! Violations of the permission bits fail fast under `debug_assertions` and
//! are silent in release builds.

use std::cell::RefCell;
use std::sync::Arc;

use crate::error::{Result, TrackerError};
use crate::runner::{SequencedTaskRunner, SingleThreadTaskRunner};
use crate::sequence::{Sequence, SequenceToken};
use crate::task::{ShutdownBehavior, Task, TaskPriority};

struct PolicyState {
    sequence_token: Option<SequenceToken>,
    sequenced_runner: Option<Arc<dyn SequencedTaskRunner>>,
    single_thread_runner: Option<Arc<dyn SingleThreadTaskRunner>>,
    blocking_allowed: bool,
    sync_primitives_allowed: bool,
    singletons_allowed: bool,
    priority_override: Option<TaskPriority>,
}

impl Default for PolicyState {
    // Outside of any task a thread may do anything; the bits only tighten
    // for the extent of a task whose traits did not ask for them.
    fn default() -> Self {
        Self {
            sequence_token: None,
            sequenced_runner: None,
            single_thread_runner: None,
            blocking_allowed: true,
            sync_primitives_allowed: true,
            singletons_allowed: true,
            priority_override: None,
        }
    }
}

thread_local! {
    static POLICY: RefCell<PolicyState> = RefCell::new(PolicyState::default());
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// RAII scope holding a task's thread-local policy while its closure runs.
pub(crate) struct TaskPolicyScope {
    saved: Option<PolicyState>,
}

impl TaskPolicyScope {
    /// Derive the policy from the sequence's traits and the task's runner
    /// back-references, install it, and remember what it replaced.
    pub(crate) fn install(sequence: &Arc<Sequence>, task: &Task) -> Self {
        let traits = sequence.traits();

        let single_thread_runner = task
            .single_thread_runner_ref()
            .and_then(std::sync::Weak::upgrade);
        // A single-thread handle answers sequenced-handle queries too.
        let sequenced_runner = task
            .sequenced_runner_ref()
            .and_then(std::sync::Weak::upgrade)
            .or_else(|| {
                single_thread_runner
                    .clone()
                    .map(|runner| runner as Arc<dyn SequencedTaskRunner>)
            });

        let installed = PolicyState {
            sequence_token: Some(sequence.token()),
            sequenced_runner,
            single_thread_runner,
            blocking_allowed: traits.allows_blocking(),
            sync_primitives_allowed: traits.allows_sync_primitives(),
            // Singletons may already be torn down while a
            // continue-on-shutdown task is still running.
            singletons_allowed: traits.shutdown_behavior()
                != ShutdownBehavior::ContinueOnShutdown,
            // Tasks posted from within this task inherit its priority.
            priority_override: Some(sequence.priority()),
        };

        tracing::trace!(sequence = %sequence.token(), "policy scope installed");
        let saved = POLICY.with(|policy| policy.replace(installed));
        Self { saved: Some(saved) }
    }
}

impl Drop for TaskPolicyScope {
    fn drop(&mut self) {
        let saved = self.saved.take().expect("policy scope dropped twice");
        POLICY.with(|policy| policy.replace(saved));
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Token of the sequence whose task is running on the current thread.
///
/// Valid only during the dynamic extent of a task's execution.
pub fn current_sequence_token() -> Result<SequenceToken> {
    POLICY
        .with(|policy| policy.borrow().sequence_token)
        .ok_or(TrackerError::NotInTask)
}

/// Handle to the sequenced task runner that posted the currently running
/// task, if the task carried a back-reference (a single-thread runner
/// satisfies this query as well).
pub fn sequenced_runner_handle() -> Result<Arc<dyn SequencedTaskRunner>> {
    POLICY.with(|policy| {
        let state = policy.borrow();
        let token = state.sequence_token.ok_or(TrackerError::NotInTask)?;
        state
            .sequenced_runner
            .as_ref()
            .map(Arc::clone)
            .ok_or(TrackerError::NoRunnerHandle { sequence: token })
    })
}

/// Handle to the single-thread task runner that posted the currently running
/// task, if the task carried one.
pub fn single_thread_runner_handle() -> Result<Arc<dyn SingleThreadTaskRunner>> {
    POLICY.with(|policy| {
        let state = policy.borrow();
        let token = state.sequence_token.ok_or(TrackerError::NotInTask)?;
        state
            .single_thread_runner
            .as_ref()
            .map(Arc::clone)
            .ok_or(TrackerError::NoRunnerHandle { sequence: token })
    })
}

// ---------------------------------------------------------------------------
// Restriction assertions
// ---------------------------------------------------------------------------

fn policy_violation(message: &str) {
    // Fail fast in debug builds; release builds stay silent.
    if cfg!(debug_assertions) {
        panic!("policy violation: {message}");
    }
}

/// Assert that the running task declared the `may_block` trait. Call before
/// blocking I/O.
pub fn assert_blocking_allowed() {
    POLICY.with(|policy| {
        if !policy.borrow().blocking_allowed {
            policy_violation("blocking I/O requires the may_block trait");
        }
    });
}

/// Assert that the running task declared `with_base_sync_primitives`. Call
/// before waiting on a synchronization primitive.
pub fn assert_sync_primitives_allowed() {
    POLICY.with(|policy| {
        if !policy.borrow().sync_primitives_allowed {
            policy_violation(
                "waiting on sync primitives requires the with_base_sync_primitives trait",
            );
        }
    });
}

/// Assert that the running task may touch process singletons. Fails for
/// continue-on-shutdown tasks, which can outlive singleton teardown.
pub fn assert_singleton_allowed() {
    POLICY.with(|policy| {
        if !policy.borrow().singletons_allowed {
            policy_violation("continue-on-shutdown tasks must not access singletons");
        }
    });
}

/// Override a restriction bit directly. Test-only escape hatch mirroring the
/// scoped setters the policy scope itself uses.
#[doc(hidden)]
pub fn set_singleton_allowed_for_testing(allowed: bool) -> bool {
    POLICY.with(|policy| {
        let mut state = policy.borrow_mut();
        std::mem::replace(&mut state.singletons_allowed, allowed)
    })
}

// ---------------------------------------------------------------------------
// Priority override
// ---------------------------------------------------------------------------

/// Scoped priority override: trait bundles built on this thread without an
/// explicit priority inherit `priority` while the scope is alive.
pub struct ScopedPriorityOverride {
    saved: Option<TaskPriority>,
}

impl ScopedPriorityOverride {
    /// Install the override, remembering the previous one.
    #[must_use]
    pub fn new(priority: TaskPriority) -> Self {
        let saved = POLICY.with(|policy| {
            let mut state = policy.borrow_mut();
            std::mem::replace(&mut state.priority_override, Some(priority))
        });
        Self { saved }
    }
}

impl Drop for ScopedPriorityOverride {
    fn drop(&mut self) {
        let saved = self.saved.take();
        POLICY.with(|policy| policy.borrow_mut().priority_override = saved);
    }
}

pub(crate) fn current_priority_override() -> Option<TaskPriority> {
    POLICY.with(|policy| policy.borrow().priority_override)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
