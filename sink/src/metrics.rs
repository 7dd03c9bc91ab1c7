//! Metrics definitions for the mutation-application engine.

use std::sync::Once;

use metrics::{Unit, describe_counter};

static REGISTER_METRICS: Once = Once::new();

/// Label for the destination table in metrics.
pub const TABLE_NAME_LABEL: &str = "table_name";

/// Label for the reason a mutation was dropped.
pub const REASON_LABEL: &str = "reason";

/// Label for the kind of user function.
pub const FUNCTION_LABEL: &str = "function";

/// Label for the dead-letter queue a mutation was sent to.
pub const QUEUE_LABEL: &str = "queue";

/// Counter for mutations written to a destination table.
pub const SINK_MUTATIONS_APPLIED_TOTAL: &str = "sink_mutations_applied_total";

/// Counter for deletes applied to a destination table.
pub const SINK_MUTATIONS_DELETED_TOTAL: &str = "sink_mutations_deleted_total";

/// Counter for mutations sent to a dead-letter queue.
pub const SINK_MUTATIONS_DLQ_TOTAL: &str = "sink_mutations_dlq_total";

/// Counter for mutations discarded without a record.
pub const SINK_MUTATIONS_DROPPED_TOTAL: &str = "sink_mutations_dropped_total";

/// Counter for conflicts handed to a merge strategy or dropped as stale.
pub const SINK_MERGE_CONFLICTS_TOTAL: &str = "sink_merge_conflicts_total";

/// Counter for user functions that failed, timed out, or panicked.
pub const SINK_USER_FUNCTION_FAILURES_TOTAL: &str = "sink_user_function_failures_total";

/// Registers the metrics emitted by the sink. It is safe to call this method multiple times;
/// the metrics are only described once.
pub fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            SINK_MUTATIONS_APPLIED_TOTAL,
            Unit::Count,
            "Total number of mutations written to destination tables"
        );

        describe_counter!(
            SINK_MUTATIONS_DELETED_TOTAL,
            Unit::Count,
            "Total number of deletes applied to destination tables"
        );

        describe_counter!(
            SINK_MUTATIONS_DLQ_TOTAL,
            Unit::Count,
            "Total number of mutations sent to a dead-letter queue"
        );

        describe_counter!(
            SINK_MUTATIONS_DROPPED_TOTAL,
            Unit::Count,
            "Total number of mutations discarded, labelled by reason"
        );

        describe_counter!(
            SINK_MERGE_CONFLICTS_TOTAL,
            Unit::Count,
            "Total number of compare-and-set conflicts"
        );

        describe_counter!(
            SINK_USER_FUNCTION_FAILURES_TOTAL,
            Unit::Count,
            "Total number of failed user function invocations, labelled by function"
        );
    });
}
