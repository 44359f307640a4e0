//! Sequences: ordered, single-consumer task queues.
//!
//! A [`Sequence`] is a FIFO of admitted tasks sharing one identity token.
//! At most one worker drains a sequence at a time, while producers may keep
//! pushing to it concurrently; a [`SequenceTransaction`] is the only way to
//! touch the queue and provides that mutual exclusion. The tracker's lock is
//! always acquired *inside* a sequence transaction when both are needed, and
//! neither is ever held across a task's closure.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{SequencedTime, Task, TaskPriority, TaskTraits};

/// Creation order across all sequences in the process; breaks ties between
/// equal sequenced-times in the preempted heaps.
static NEXT_CREATION_RANK: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Opaque identity of a sequence, stable for the sequence's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceToken(Uuid);

impl SequenceToken {
    fn mint() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying id, for logging and diagnostics.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered, single-consumer queue of tasks sharing an identity token.
///
/// Kept alive by every worker that currently holds a reference, and by a
/// preempted heap while parked. The tracker itself holds no sequences.
pub struct Sequence {
    token: SequenceToken,
    traits: TaskTraits,
    priority: TaskPriority,
    creation_rank: u64,
    queue: Mutex<VecDeque<Task>>,
}

impl Sequence {
    /// Create an empty sequence. The priority class is resolved once, here,
    /// so a scoped priority override on the creating thread is honored for
    /// the sequence's whole lifetime.
    #[must_use]
    pub fn new(traits: TaskTraits) -> Arc<Self> {
        let priority = traits.priority();
        let sequence = Arc::new(Self {
            token: SequenceToken::mint(),
            traits,
            priority,
            creation_rank: NEXT_CREATION_RANK.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::new()),
        });
        tracing::trace!(sequence = %sequence.token, ?priority, "sequence created");
        sequence
    }

    /// Create a sequence already holding one admitted task. Convenience used
    /// pervasively by tests and simple runners.
    #[must_use]
    pub fn with_task(task: Task, traits: TaskTraits) -> Arc<Self> {
        let sequence = Self::new(traits);
        sequence.begin_transaction().push_task(task);
        sequence
    }

    /// The sequence's identity token.
    #[must_use]
    pub fn token(&self) -> SequenceToken {
        self.token
    }

    /// The trait bundle shared by every task in the sequence.
    #[must_use]
    pub fn traits(&self) -> &TaskTraits {
        &self.traits
    }

    /// The priority class resolved at creation. Posting more tasks never
    /// changes it.
    #[must_use]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub(crate) fn creation_rank(&self) -> u64 {
        self.creation_rank
    }

    /// Open a transaction on the queue. Blocks while another thread holds
    /// one for this sequence; transactions on distinct sequences are
    /// independent.
    pub fn begin_transaction(self: &Arc<Self>) -> SequenceTransaction<'_> {
        SequenceTransaction {
            sequence: self,
            queue: self.queue.lock().expect("sequence queue poisoned"),
        }
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("token", &self.token)
            .field("priority", &self.priority)
            .field("creation_rank", &self.creation_rank)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Exclusive access to a sequence's task queue.
///
/// A transaction may be held across a single tracker call
/// (`will_schedule_sequence` takes one); the tracker never holds its own
/// lock while user code runs.
pub struct SequenceTransaction<'a> {
    sequence: &'a Arc<Sequence>,
    queue: MutexGuard<'a, VecDeque<Task>>,
}

impl SequenceTransaction<'_> {
    /// Append an admitted task. Pushing a task that was never admitted is a
    /// contract violation.
    pub fn push_task(&mut self, task: Task) {
        assert!(
            task.sequenced_time().is_some(),
            "task posted from {} was pushed without being admitted",
            task.posted_from()
        );
        tracing::trace!(
            sequence = %self.sequence.token,
            posted_from = %task.posted_from(),
            queued = self.queue.len() + 1,
            "task enqueued"
        );
        self.queue.push_back(task);
    }

    /// Borrow the front task without removing it.
    #[must_use]
    pub fn front(&self) -> Option<&Task> {
        self.queue.front()
    }

    /// Remove and return the front task.
    ///
    /// # Panics
    ///
    /// Panics if the sequence is empty; popping past the end is a contract
    /// violation.
    pub fn pop_front(&mut self) -> Task {
        self.queue
            .pop_front()
            .unwrap_or_else(|| panic!("popped from empty sequence {}", self.sequence.token))
    }

    /// The sequence's current sequenced-time: the front task's admission
    /// stamp, or `None` when the sequence is idle.
    #[must_use]
    pub fn next_sequenced_time(&self) -> Option<SequencedTime> {
        self.queue.front().and_then(Task::sequenced_time)
    }

    /// Whether the queue holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// The sequence's identity token.
    #[must_use]
    pub fn token(&self) -> SequenceToken {
        self.sequence.token
    }

    /// The sequence's trait bundle.
    #[must_use]
    pub fn traits(&self) -> &TaskTraits {
        &self.sequence.traits
    }

    /// The sequence's priority class.
    #[must_use]
    pub fn priority(&self) -> TaskPriority {
        self.sequence.priority
    }

    pub(crate) fn sequence(&self) -> &Arc<Sequence> {
        self.sequence
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
