use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::SinkResult;
use crate::merge::{MergeOperation, MergeResult};
use crate::script::{FunctionInvoker, FunctionKind, MergeFunction};
use crate::types::Document;

/// Dead-letter queue receiving conflicts the standard merge cannot resolve on its own.
pub const UNMERGED_DLQ: &str = "unmerged";

/// How the properties of a conflicting row were classified.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// The target row with every mergeable proposed value written over it.
    pub merged: Document,
    /// Properties that could not be merged automatically, in name order.
    pub unmerged: Vec<String>,
}

/// The built-in merge strategy.
///
/// In a three-way merge a proposed value wins when the target still holds the value the change
/// was computed against (`target[p] == before[p]`). In a two-way merge nothing is known about
/// the baseline, so every proposed value that differs from the target is a conflict. Properties
/// the proposed row does not carry keep their target value.
///
/// Conflicts are handed to the fallback function if there is one, and otherwise sent to
/// [`UNMERGED_DLQ`].
#[derive(Clone, Default)]
pub struct StandardMerge {
    fallback: Option<Arc<dyn MergeFunction>>,
}

impl StandardMerge {
    pub fn new(fallback: Option<Arc<dyn MergeFunction>>) -> Self {
        Self { fallback }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Splits the properties of `op` into merged and unmerged ones.
    pub fn classify(op: &MergeOperation) -> Classification {
        let names: BTreeSet<&str> = op.target.names().chain(op.proposed.names()).collect();

        let mut merged = op.target.clone();
        let mut unmerged = Vec::new();

        for name in names {
            let Some(proposed) = op.proposed.get(name) else {
                continue;
            };
            let target = op.target.get(name);

            if target == Some(proposed) {
                continue;
            }

            let mergeable = match &op.before {
                Some(before) => target == before.get(name),
                None => false,
            };

            if mergeable {
                merged.insert(name, proposed.clone());
            } else {
                unmerged.push(name.to_string());
            }
        }

        Classification { merged, unmerged }
    }

    pub async fn merge(
        &self,
        op: &MergeOperation,
        invoker: &FunctionInvoker,
    ) -> SinkResult<MergeResult> {
        let Classification { merged, unmerged } = Self::classify(op);

        if unmerged.is_empty() {
            return Ok(MergeResult::Apply(merged));
        }

        let Some(fallback) = self.fallback.clone() else {
            debug!(unmerged = ?unmerged, "standard merge left conflicts unresolved");
            return Ok(MergeResult::Dlq(UNMERGED_DLQ.to_string()));
        };

        let mut op = op.clone();
        op.unmerged = unmerged;

        let value = invoker
            .invoke(FunctionKind::Merge, move || fallback.merge(&op))
            .await?;

        MergeResult::from_script_value(value)
    }
}

impl fmt::Debug for StandardMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardMerge")
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
