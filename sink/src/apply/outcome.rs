use std::fmt;

use serde::Serialize;

use crate::types::{RowKey, TableName};

/// Why a mutation was discarded without a dead-letter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// A dispatch or map function returned null.
    Discarded,
    /// A deadline column was older than its maximum age.
    Deadline,
    /// The CAS columns were not newer than the target row and no merge strategy is set.
    Stale,
    /// The merge strategy chose to drop the mutation.
    MergeDropped,
    /// The mutation could not be represented, e.g. a user function returned a non-document.
    Invalid,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Discarded => "discarded",
            DropReason::Deadline => "deadline",
            DropReason::Stale => "stale",
            DropReason::MergeDropped => "merge_dropped",
            DropReason::Invalid => "invalid",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The row was written.
    Applied,
    /// The row was deleted.
    Deleted,
    /// The mutation was parked in the named dead-letter queue.
    Dlq { queue: String },
    /// The mutation was discarded.
    Dropped { reason: DropReason },
}

/// The outcome of one mutation produced from a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    /// Position of the source mutation in its batch.
    pub index: usize,
    /// Destination table, unknown when routing itself failed or discarded the mutation.
    pub table: Option<TableName>,
    pub key: Option<RowKey>,
    pub disposition: Disposition,
}

impl MutationOutcome {
    pub fn is_applied(&self) -> bool {
        self.disposition == Disposition::Applied
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.disposition, Disposition::Dropped { .. })
    }

    pub fn dlq_queue(&self) -> Option<&str> {
        match &self.disposition {
            Disposition::Dlq { queue } => Some(queue),
            _ => None,
        }
    }
}
