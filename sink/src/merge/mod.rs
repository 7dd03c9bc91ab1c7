//! Conflict resolution for tables with compare-and-set columns.

mod cas;
mod operation;
mod standard;

use std::sync::Arc;

pub use cas::{
    MergeFailure, Proposal, Resolution, compare_cas, compare_values, is_conflict, resolve,
};
pub use operation::{MergeOperation, MergeResult};
pub use standard::{Classification, StandardMerge, UNMERGED_DLQ};

use crate::script::MergeFunction;

/// How a table resolves conflicts.
#[derive(Debug, Clone)]
pub enum MergeStrategy {
    /// A user merge function.
    Custom(Arc<dyn MergeFunction>),
    /// The built-in merge, optionally with a user fallback.
    Standard(StandardMerge),
}
