use serde::Serialize;
use serde_json::{Map, Value};

use crate::bail;
use crate::error::{ErrorKind, SinkResult};
use crate::types::Document;

const APPLY_KEY: &str = "apply";
const DLQ_KEY: &str = "dlq";
const DROP_KEY: &str = "drop";

/// The context handed to a merge function when a proposed row conflicts with the target row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOperation {
    /// The row as it was before the change. Only present in a three-way merge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Document>,
    pub meta: Document,
    /// The incoming row that could not be applied.
    pub proposed: Document,
    /// The conflicting row currently stored.
    pub target: Document,
    /// Columns the standard merge could not resolve, set only when it calls its fallback.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unmerged: Vec<String>,
}

impl MergeOperation {
    pub fn new(
        before: Option<Document>,
        meta: Document,
        proposed: Document,
        target: Document,
    ) -> Self {
        Self {
            before,
            meta,
            proposed,
            target,
            unmerged: Vec::new(),
        }
    }

    pub fn is_three_way(&self) -> bool {
        self.before.is_some()
    }
}

/// The decision of a merge strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeResult {
    /// Write the document into the target row.
    Apply(Document),
    /// Send the mutation to the named dead-letter queue.
    Dlq(String),
    /// Discard the mutation.
    Drop,
}

impl MergeResult {
    /// Validates the value returned by a user merge function.
    ///
    /// The value must be an object with exactly one of `apply` (a document), `dlq` (a non-empty
    /// queue name), or `drop` (`true`). Anything else is rejected rather than guessed at.
    pub fn from_script_value(value: Value) -> SinkResult<Self> {
        let mut object = match value {
            Value::Object(object) => object,
            other => bail!(
                ErrorKind::MalformedMergeResult,
                "Merge result is not an object",
                format!("found {other}")
            ),
        };

        if let Some(unknown) = object
            .keys()
            .find(|key| ![APPLY_KEY, DLQ_KEY, DROP_KEY].contains(&key.as_str()))
        {
            bail!(
                ErrorKind::MalformedMergeResult,
                "Merge result has an unknown property",
                unknown
            );
        }

        let apply = take_set(&mut object, APPLY_KEY);
        let dlq = take_set(&mut object, DLQ_KEY);
        let drop = take_set(&mut object, DROP_KEY);

        match (apply, dlq, drop) {
            (Some(apply), None, None) => match Document::try_from(apply) {
                Ok(document) => Ok(MergeResult::Apply(document)),
                Err(err) => bail!(
                    ErrorKind::MalformedMergeResult,
                    "Merge result `apply` is not a document",
                    err.detail().unwrap_or_default()
                ),
            },
            (None, Some(Value::String(queue)), None) if !queue.trim().is_empty() => {
                Ok(MergeResult::Dlq(queue))
            }
            (None, Some(other), None) => bail!(
                ErrorKind::MalformedMergeResult,
                "Merge result `dlq` must be a non-empty queue name",
                other
            ),
            (None, None, Some(Value::Bool(true))) => Ok(MergeResult::Drop),
            (None, None, Some(other)) => bail!(
                ErrorKind::MalformedMergeResult,
                "Merge result `drop` must be true",
                other
            ),
            (None, None, None) => bail!(
                ErrorKind::MalformedMergeResult,
                "Merge result sets none of apply, dlq, or drop"
            ),
            _ => bail!(
                ErrorKind::MalformedMergeResult,
                "Merge result sets more than one of apply, dlq, or drop"
            ),
        }
    }
}

/// Removes a property, treating null as unset.
fn take_set(object: &mut Map<String, Value>, key: &str) -> Option<Value> {
    object.remove(key).filter(|value| !value.is_null())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_exactly_one_variant() {
        assert_eq!(
            MergeResult::from_script_value(json!({"apply": {"a": 1}})).unwrap(),
            MergeResult::Apply(Document::try_from(json!({"a": 1})).unwrap())
        );
        assert_eq!(
            MergeResult::from_script_value(json!({"dlq": "conflicts"})).unwrap(),
            MergeResult::Dlq("conflicts".to_string())
        );
        assert_eq!(
            MergeResult::from_script_value(json!({"drop": true})).unwrap(),
            MergeResult::Drop
        );
        assert_eq!(
            MergeResult::from_script_value(json!({"drop": true, "dlq": null})).unwrap(),
            MergeResult::Drop
        );
    }

    #[test]
    fn rejects_malformed_results() {
        for value in [
            json!({}),
            json!(null),
            json!("apply"),
            json!({"apply": {"a": 1}, "drop": true}),
            json!({"apply": [1]}),
            json!({"dlq": ""}),
            json!({"dlq": 5}),
            json!({"drop": false}),
            json!({"drop": true, "extra": 1}),
        ] {
            let err = MergeResult::from_script_value(value.clone()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedMergeResult, "{value}");
        }
    }

    #[test]
    fn operation_serializes_without_empty_fields() {
        let op = MergeOperation::new(
            None,
            Document::new(),
            Document::try_from(json!({"a": 1})).unwrap(),
            Document::try_from(json!({"a": 2})).unwrap(),
        );

        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"meta": {}, "proposed": {"a": 1}, "target": {"a": 2}})
        );
    }
}
