//! Task latency metrics.
//!
//! Every executed task records one `TaskLatencyMicroseconds` sample --
//! admission to execution start -- keyed by the pool label, the priority
//! class, and whether the task was allowed to block or wait. Bucketing and
//! aggregation are the sink's business; the tracker only names the series
//! and hands over raw microseconds.

use crate::task::TaskPriority;

/// Destination for histogram samples. Implementations must be cheap; the
/// tracker calls this on the dispatch path.
pub trait MetricsSink: Send + Sync {
    /// Record one sample into the named series.
    fn record_histogram(&self, name: &str, value_micros: u64);
}

/// Default sink: emits each sample as a `tracing` event at trace level.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_histogram(&self, name: &str, value_micros: u64) {
        tracing::trace!(histogram = name, micros = value_micros, "latency sample");
    }
}

fn priority_suffix(priority: TaskPriority) -> &'static str {
    match priority {
        TaskPriority::BestEffort => "BestEffortTaskPriority",
        TaskPriority::UserVisible => "UserVisibleTaskPriority",
        TaskPriority::UserBlocking => "UserBlockingTaskPriority",
    }
}

/// Series name for one `(pool, priority, may_block_or_sync)` combination.
pub(crate) fn task_latency_histogram_name(
    pool_label: &str,
    priority: TaskPriority,
    may_block_or_sync: bool,
) -> String {
    let suffix = priority_suffix(priority);
    let blocking = if may_block_or_sync { "_MayBlock" } else { "" };
    format!("SeqPool.TaskLatencyMicroseconds.{pool_label}.{suffix}{blocking}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_every_combination() {
        let cases = [
            (
                TaskPriority::BestEffort,
                false,
                "SeqPool.TaskLatencyMicroseconds.Test.BestEffortTaskPriority",
            ),
            (
                TaskPriority::BestEffort,
                true,
                "SeqPool.TaskLatencyMicroseconds.Test.BestEffortTaskPriority_MayBlock",
            ),
            (
                TaskPriority::UserVisible,
                false,
                "SeqPool.TaskLatencyMicroseconds.Test.UserVisibleTaskPriority",
            ),
            (
                TaskPriority::UserVisible,
                true,
                "SeqPool.TaskLatencyMicroseconds.Test.UserVisibleTaskPriority_MayBlock",
            ),
            (
                TaskPriority::UserBlocking,
                false,
                "SeqPool.TaskLatencyMicroseconds.Test.UserBlockingTaskPriority",
            ),
            (
                TaskPriority::UserBlocking,
                true,
                "SeqPool.TaskLatencyMicroseconds.Test.UserBlockingTaskPriority_MayBlock",
            ),
        ];

        for (priority, blocking, expected) in cases {
            assert_eq!(task_latency_histogram_name("Test", priority, blocking), expected);
        }
    }
}
