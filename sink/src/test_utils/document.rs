use serde_json::Value;

use crate::types::{Document, DocumentValue, Hlc, Mutation, RowKey, TableName};

/// Builds a document from a JSON object.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn doc(value: Value) -> Document {
    Document::try_from(value).expect("test document must be a JSON object")
}

/// Builds a row key from JSON values.
pub fn row_key(values: &[Value]) -> RowKey {
    RowKey::new(values.iter().cloned().map(DocumentValue::from).collect())
}

/// Parses a table name.
///
/// # Panics
///
/// Panics if `name` is not a valid table name.
pub fn table_name(name: &str) -> TableName {
    name.parse().expect("test table name must be valid")
}

/// Builds an upsert keyed by the `id` property of `data`, or by nothing if it has none.
pub fn upsert(data: Value, nanos: i64) -> Mutation {
    let data = doc(data);
    let key = data.get("id").cloned().into_iter().collect();

    Mutation::upsert(data, key, Hlc::new(nanos, 0))
}

/// Builds a delete of the row with the given `id`.
pub fn delete(id: Value, nanos: i64) -> Mutation {
    Mutation::delete(vec![DocumentValue::from(id)], Hlc::new(nanos, 0))
}
