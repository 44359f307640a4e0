//! Extension executor registry.
//!
//! Tasks whose traits carry an [`ExtensionId`] are routed to an alternative
//! executor instead of the tracker's own dispatch path. Routing itself
//! happens upstream; this module only owns the process-wide id → executor
//! table. Registration is allowed exactly once per id and only during
//! process start-up: the registry freezes the moment any tracker admits its
//! first task.

use std::cell::Cell;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::task::{ExtensionId, Task};

/// An alternative executor for extension-routed tasks.
pub trait TaskExecutor: Send + Sync {
    /// Take ownership of the task and run it by the executor's own rules.
    fn execute(&self, task: Task);
}

thread_local! {
    static IN_REGISTRATION: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside [`ExecutorRegistry::register`].
/// Posting a task from there is a contract violation.
pub(crate) fn in_registration() -> bool {
    IN_REGISTRATION.with(Cell::get)
}

/// Process-wide id → executor table backed by [`DashMap`].
pub struct ExecutorRegistry {
    executors: DashMap<ExtensionId, Arc<dyn TaskExecutor>>,
    frozen: AtomicBool,
}

impl ExecutorRegistry {
    /// An empty, unfrozen registry. Prefer [`ExecutorRegistry::global`]
    /// outside of tests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
            frozen: AtomicBool::new(false),
        }
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<ExecutorRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Register `executor` under `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered, or if any tracker has already
    /// admitted a task (the registry is frozen).
    pub fn register(&self, id: ExtensionId, executor: Arc<dyn TaskExecutor>) {
        assert!(
            !self.frozen.load(Ordering::Acquire),
            "executor {id} registered after the first task admission"
        );

        IN_REGISTRATION.with(|flag| flag.set(true));
        let previous = self.executors.insert(id, executor);
        IN_REGISTRATION.with(|flag| flag.set(false));

        assert!(previous.is_none(), "executor {id} registered twice");
        tracing::info!(extension_id = %id, "task executor registered");
    }

    /// Remove the executor registered under `id`.
    ///
    /// # Panics
    ///
    /// Panics if nothing is registered under `id`.
    pub fn unregister(&self, id: ExtensionId) -> Arc<dyn TaskExecutor> {
        let (_, executor) = self
            .executors
            .remove(&id)
            .unwrap_or_else(|| panic!("no executor registered under {id}"));
        tracing::info!(extension_id = %id, "task executor unregistered");
        executor
    }

    /// Look up the executor for `id`.
    #[must_use]
    pub fn get(&self, id: ExtensionId) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether anything is registered under `id`.
    #[must_use]
    pub fn is_registered(&self, id: ExtensionId) -> bool {
        self.executors.contains_key(&id)
    }

    /// Number of registered executors.
    #[must_use]
    pub fn count(&self) -> usize {
        self.executors.len()
    }

    /// Refuse further registrations. Idempotent; invoked by every tracker on
    /// admission.
    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingExecutor {
        executed: AtomicUsize,
    }

    impl CountingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                executed: AtomicUsize::new(0),
            })
        }
    }

    impl TaskExecutor for CountingExecutor {
        fn execute(&self, task: Task) {
            self.executed.fetch_add(1, Ordering::SeqCst);
            (task.into_closure())();
        }
    }

    #[test]
    fn register_and_route() {
        let registry = ExecutorRegistry::new();
        let executor = CountingExecutor::new();
        let id = ExtensionId(1);

        assert!(!registry.is_registered(id));
        registry.register(id, Arc::clone(&executor) as Arc<dyn TaskExecutor>);
        assert!(registry.is_registered(id));
        assert_eq!(registry.count(), 1);

        let routed = registry.get(id).expect("executor should be registered");
        routed.execute(Task::new(|| {}));
        assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let registry = ExecutorRegistry::new();
        let id = ExtensionId(2);
        registry.register(id, CountingExecutor::new());
        registry.register(id, CountingExecutor::new());
    }

    #[test]
    #[should_panic(expected = "after the first task admission")]
    fn registration_after_freeze_panics() {
        let registry = ExecutorRegistry::new();
        registry.freeze();
        registry.register(ExtensionId(3), CountingExecutor::new());
    }

    #[test]
    fn unregister_returns_the_executor() {
        let registry = ExecutorRegistry::new();
        let id = ExtensionId(4);
        registry.register(id, CountingExecutor::new());

        let _executor = registry.unregister(id);
        assert!(!registry.is_registered(id));
    }

    #[test]
    #[should_panic(expected = "no executor registered")]
    fn unregister_missing_panics() {
        ExecutorRegistry::new().unregister(ExtensionId(5));
    }
}
