use std::cmp::Ordering;

use metrics::counter;
use serde_json::Number;
use tracing::debug;

use crate::apply::DropReason;
use crate::conversions::timestamp::{parse_hlc, parse_timestamp};
use crate::error::SinkError;
use crate::merge::{MergeOperation, MergeResult, MergeStrategy};
use crate::metrics::{SINK_MERGE_CONFLICTS_TOTAL, TABLE_NAME_LABEL};
use crate::script::{FunctionInvoker, FunctionKind, TableConfig};
use crate::types::{Document, DocumentValue, TableName};

static NULL: DocumentValue = DocumentValue::Null;

/// The row a mutation proposes, with the context a merge needs.
#[derive(Debug, Clone, Copy)]
pub struct Proposal<'a> {
    pub table: &'a TableName,
    pub proposed: &'a Document,
    pub before: Option<&'a Document>,
    pub meta: &'a Document,
}

/// The decision taken for a mutation on a table with compare-and-set columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Write the document.
    Apply(Document),
    /// Park the mutation in a dead-letter queue.
    Dlq {
        queue: String,
        operation: MergeOperation,
    },
    /// Discard the mutation.
    Drop {
        reason: DropReason,
        operation: MergeOperation,
    },
}

/// A merge function failed. The operation it was given is kept for the dead-letter queue.
#[derive(Debug, Clone)]
pub struct MergeFailure {
    pub error: SinkError,
    pub operation: MergeOperation,
}

/// Decides what happens to a proposed row given the current target row.
///
/// 1. Without a target row, the proposal is inserted.
/// 2. A proposal already contained in the target row is a replay and applies as a no-op.
/// 3. A proposal whose CAS tuple is strictly greater than the target's applies.
/// 4. Anything else is a conflict, resolved by the table's merge strategy. Tables without one
///    drop the stale proposal.
pub async fn resolve(
    config: &TableConfig,
    proposal: Proposal<'_>,
    target: Option<&Document>,
    invoker: &FunctionInvoker,
) -> Result<Resolution, MergeFailure> {
    let Some(target) = target else {
        return Ok(Resolution::Apply(proposal.proposed.clone()));
    };

    if !is_conflict(&config.cas, proposal.proposed, target) {
        return Ok(Resolution::Apply(proposal.proposed.clone()));
    }

    counter!(
        SINK_MERGE_CONFLICTS_TOTAL,
        TABLE_NAME_LABEL => proposal.table.to_string()
    )
    .increment(1);

    let operation = MergeOperation::new(
        proposal.before.cloned(),
        proposal.meta.clone(),
        proposal.proposed.clone(),
        target.clone(),
    );

    let result = match &config.merge {
        None => {
            debug!(
                table = %proposal.table,
                "stale proposal dropped, no merge strategy configured"
            );
            return Ok(Resolution::Drop {
                reason: DropReason::Stale,
                operation,
            });
        }
        Some(MergeStrategy::Standard(standard)) => standard.merge(&operation, invoker).await,
        Some(MergeStrategy::Custom(function)) => {
            let function = function.clone();
            let op = operation.clone();
            invoker
                .invoke(FunctionKind::Merge, move || function.merge(&op))
                .await
                .and_then(MergeResult::from_script_value)
        }
    };

    match result {
        Ok(MergeResult::Apply(document)) => Ok(Resolution::Apply(document)),
        Ok(MergeResult::Dlq(queue)) => Ok(Resolution::Dlq { queue, operation }),
        Ok(MergeResult::Drop) => Ok(Resolution::Drop {
            reason: DropReason::MergeDropped,
            operation,
        }),
        Err(error) => Err(MergeFailure { error, operation }),
    }
}

/// Returns `true` if `proposed` can neither replay onto nor supersede `target`.
pub fn is_conflict(columns: &[String], proposed: &Document, target: &Document) -> bool {
    !proposed.is_subset_of(target) && compare_cas(columns, proposed, target) != Ordering::Greater
}

/// Compares the CAS tuples of two rows, column by column in configured order.
///
/// The first differing column decides. Missing columns compare as null.
pub fn compare_cas(columns: &[String], proposed: &Document, target: &Document) -> Ordering {
    columns
        .iter()
        .map(|column| compare_values(proposed.get(column), target.get(column)))
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Total order over document values used for CAS comparisons.
///
/// Values of different types order as null < bool < number < string < array < document.
/// Numbers compare numerically. Strings that both read as HLC timestamps, or both as
/// timestamps, compare as time and otherwise lexicographically.
pub fn compare_values(a: Option<&DocumentValue>, b: Option<&DocumentValue>) -> Ordering {
    let a = a.unwrap_or(&NULL);
    let b = b.unwrap_or(&NULL);

    match (a, b) {
        (DocumentValue::Null, DocumentValue::Null) => Ordering::Equal,
        (DocumentValue::Bool(a), DocumentValue::Bool(b)) => a.cmp(b),
        (DocumentValue::Number(a), DocumentValue::Number(b)) => compare_numbers(a, b),
        (DocumentValue::String(a), DocumentValue::String(b)) => compare_strings(a, b),
        (DocumentValue::Array(a), DocumentValue::Array(b)) => {
            for (a, b) in a.iter().zip(b) {
                let ordering = compare_values(Some(a), Some(b));
                if ordering.is_ne() {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        (DocumentValue::Document(a), DocumentValue::Document(b)) => {
            a.to_json().to_string().cmp(&b.to_json().to_string())
        }
        (a, b) => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(value: &DocumentValue) -> u8 {
    match value {
        DocumentValue::Null => 0,
        DocumentValue::Bool(_) => 1,
        DocumentValue::Number(_) => 2,
        DocumentValue::String(_) => 3,
        DocumentValue::Array(_) => 4,
        DocumentValue::Document(_) => 5,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a.cmp(&b);
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        _ => Ordering::Equal,
    }
}

fn compare_strings(a: &str, b: &str) -> Ordering {
    if let (Some(a), Some(b)) = (parse_hlc(a), parse_hlc(b)) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (parse_timestamp(a), parse_timestamp(b)) {
        return a.cmp(&b);
    }

    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::error::{ErrorKind, SinkResult};
    use crate::script::standard_merge;
    use crate::sink_error;

    fn doc(value: Value) -> Document {
        Document::try_from(value).unwrap()
    }

    fn value(value: Value) -> DocumentValue {
        DocumentValue::from(value)
    }

    fn invoker() -> FunctionInvoker {
        FunctionInvoker::new(Duration::from_secs(1))
    }

    fn cas_table(merge: Option<MergeStrategy>) -> TableConfig {
        TableConfig {
            cas: vec!["version".to_string()],
            merge,
            ..TableConfig::default()
        }
    }

    async fn run(
        config: &TableConfig,
        proposed: &Document,
        target: Option<&Document>,
    ) -> Result<Resolution, MergeFailure> {
        let meta = Document::new();
        let table: TableName = "t".parse().unwrap();
        let proposal = Proposal {
            table: &table,
            proposed,
            before: None,
            meta: &meta,
        };
        resolve(config, proposal, target, &invoker()).await
    }

    #[test]
    fn values_order_across_types() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-1),
            json!(2.5),
            json!(10),
            json!("a"),
            json!([1]),
            json!({"a": 1}),
        ];

        for pair in ordered.windows(2) {
            assert_eq!(
                compare_values(Some(&value(pair[0].clone())), Some(&value(pair[1].clone()))),
                Ordering::Less,
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(compare_values(None, Some(&DocumentValue::Null)), Ordering::Equal);
    }

    #[test]
    fn time_strings_compare_as_time() {
        let earlier = value(json!("2024-01-01T10:00:00+02:00"));
        let later = value(json!("2024-01-01T09:00:00Z"));
        assert_eq!(compare_values(Some(&earlier), Some(&later)), Ordering::Less);

        let small = value(json!("9.0000000001"));
        let large = value(json!("10.0000000000"));
        assert_eq!(compare_values(Some(&small), Some(&large)), Ordering::Less);
    }

    #[test]
    fn first_differing_cas_column_decides() {
        let columns = vec!["a".to_string(), "b".to_string()];

        assert_eq!(
            compare_cas(&columns, &doc(json!({"a": 1, "b": 0})), &doc(json!({"a": 1, "b": 5}))),
            Ordering::Less
        );
        assert_eq!(
            compare_cas(&columns, &doc(json!({"a": 2, "b": 0})), &doc(json!({"a": 1, "b": 5}))),
            Ordering::Greater
        );
        assert_eq!(
            compare_cas(&columns, &doc(json!({"a": 1})), &doc(json!({"a": 1, "b": null}))),
            Ordering::Equal
        );
    }

    #[test]
    fn only_stale_non_replays_conflict() {
        let columns = vec!["version".to_string()];
        let target = doc(json!({"pk": 1, "version": 2, "v": "x"}));

        assert!(!is_conflict(&columns, &doc(json!({"version": 3, "v": "y"})), &target));
        assert!(!is_conflict(&columns, &doc(json!({"version": 2})), &target));
        assert!(is_conflict(&columns, &doc(json!({"version": 2, "v": "y"})), &target));
        assert!(is_conflict(&columns, &doc(json!({"version": 1})), &target));
    }

    #[tokio::test]
    async fn absent_target_always_applies() {
        let failing = |_: &MergeOperation| -> SinkResult<Value> {
            Err(sink_error!(ErrorKind::Unknown, "must not be called"))
        };
        let config = cas_table(Some(MergeStrategy::Custom(Arc::new(failing))));
        let proposed = doc(json!({"pk": 1, "version": 1}));

        let resolution = run(&config, &proposed, None).await.unwrap();

        assert_eq!(resolution, Resolution::Apply(proposed));
    }

    #[tokio::test]
    async fn newer_proposals_apply_without_merging() {
        let config = cas_table(None);
        let proposed = doc(json!({"pk": 1, "version": 3, "v": "new"}));
        let target = doc(json!({"pk": 1, "version": 2, "v": "old"}));

        let resolution = run(&config, &proposed, Some(&target)).await.unwrap();

        assert_eq!(resolution, Resolution::Apply(proposed));
    }

    #[tokio::test]
    async fn replays_apply_without_merging() {
        let config = cas_table(None);
        let proposed = doc(json!({"pk": 1, "version": 2}));
        let target = doc(json!({"pk": 1, "version": 2, "v": "x"}));

        let resolution = run(&config, &proposed, Some(&target)).await.unwrap();

        assert_eq!(resolution, Resolution::Apply(proposed));
    }

    #[tokio::test]
    async fn stale_proposals_without_merge_are_dropped() {
        let config = cas_table(None);
        let proposed = doc(json!({"pk": 1, "version": 1, "v": "older"}));
        let target = doc(json!({"pk": 1, "version": 2, "v": "x"}));

        let resolution = run(&config, &proposed, Some(&target)).await.unwrap();

        assert!(matches!(
            resolution,
            Resolution::Drop {
                reason: DropReason::Stale,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn conflicts_use_the_merge_strategy() {
        let config = cas_table(Some(standard_merge(None)));
        let proposed = doc(json!({"pk": 1, "version": 1, "v": "older"}));
        let target = doc(json!({"pk": 1, "version": 2, "v": "x"}));

        let resolution = run(&config, &proposed, Some(&target)).await.unwrap();

        let Resolution::Dlq { queue, operation } = resolution else {
            panic!("expected a dead-letter resolution");
        };
        assert_eq!(queue, "unmerged");
        assert_eq!(operation.target, target);
        assert_eq!(operation.proposed, proposed);
    }

    #[tokio::test]
    async fn custom_merge_failures_keep_the_operation() {
        let malformed = |_: &MergeOperation| -> SinkResult<Value> { Ok(json!({})) };
        let config = cas_table(Some(MergeStrategy::Custom(Arc::new(malformed))));
        let proposed = doc(json!({"pk": 1, "version": 1}));
        let target = doc(json!({"pk": 1, "version": 2}));

        let failure = run(&config, &proposed, Some(&target)).await.unwrap_err();

        assert_eq!(failure.error.kind(), ErrorKind::MalformedMergeResult);
        assert_eq!(failure.operation.target, target);
    }

    #[tokio::test]
    async fn custom_merge_can_synthesize_rows() {
        let sum = |op: &MergeOperation| -> SinkResult<Value> {
            let total = op.target.get("count").and_then(DocumentValue::as_f64).unwrap_or(0.0)
                + op.proposed.get("count").and_then(DocumentValue::as_f64).unwrap_or(0.0);
            Ok(json!({"apply": {"pk": 1, "version": 2, "count": total}}))
        };
        let config = cas_table(Some(MergeStrategy::Custom(Arc::new(sum))));
        let proposed = doc(json!({"pk": 1, "version": 1, "count": 2}));
        let target = doc(json!({"pk": 1, "version": 2, "count": 3}));

        let resolution = run(&config, &proposed, Some(&target)).await.unwrap();

        assert_eq!(
            resolution,
            Resolution::Apply(doc(json!({"pk": 1, "version": 2, "count": 5.0})))
        );
    }
}
