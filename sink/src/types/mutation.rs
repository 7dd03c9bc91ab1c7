use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Serialize, Serializer};
use serde_json::{Number, Value};

use crate::types::{Document, DocumentValue, Hlc, TableName};

/// Metadata key naming the kind of replication source.
pub const META_SOURCE_KEY: &str = "source";
/// Metadata key naming the table the change was read from.
pub const META_TABLE_KEY: &str = "table";
/// Metadata key carrying the source timestamp of the change.
pub const META_UPDATED_KEY: &str = "updated";

/// Kind of change described by a [`Mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Upsert,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Upsert => f.write_str("upsert"),
            MutationKind::Delete => f.write_str("delete"),
        }
    }
}

/// A single row change received from the replication source.
///
/// A mutation without `data` is a deletion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mutation {
    /// The row as it was before the change, when the source provides it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Document>,
    /// The row after the change.
    pub data: Option<Document>,
    /// Primary key values of the source row.
    pub key: Vec<DocumentValue>,
    pub time: Hlc,
    /// Source-specific provenance, handed to user functions.
    pub meta: Document,
}

impl Mutation {
    pub fn upsert(data: Document, key: Vec<DocumentValue>, time: Hlc) -> Self {
        Self {
            before: None,
            data: Some(data),
            key,
            time,
            meta: Document::new(),
        }
    }

    pub fn delete(key: Vec<DocumentValue>, time: Hlc) -> Self {
        Self {
            before: None,
            data: None,
            key,
            time,
            meta: Document::new(),
        }
    }

    pub fn with_before(mut self, before: Document) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_meta(mut self, meta: Document) -> Self {
        self.meta = meta;
        self
    }

    pub fn kind(&self) -> MutationKind {
        if self.data.is_some() {
            MutationKind::Upsert
        } else {
            MutationKind::Delete
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind() == MutationKind::Delete
    }
}

/// Builds the metadata attached to mutations read from a replication source.
pub fn source_meta(source: &str, table: &TableName, updated: Hlc) -> Document {
    let mut meta = Document::new();
    meta.insert(META_SOURCE_KEY, source);
    meta.insert(META_TABLE_KEY, table.to_string());
    meta.insert(META_UPDATED_KEY, updated.to_string());
    meta
}

/// Primary key values identifying a row of a destination table.
///
/// Keys compare and hash by their canonical JSON encoding. Integral numbers are encoded as
/// integers, so `1` and `1.0` are the same key, as they are equal document values.
#[derive(Debug, Clone)]
pub struct RowKey {
    values: Vec<DocumentValue>,
    encoded: String,
}

impl RowKey {
    pub fn new(values: Vec<DocumentValue>) -> Self {
        let encoded = Value::Array(values.iter().map(canonical_json).collect()).to_string();

        Self { values, encoded }
    }

    pub fn values(&self) -> &[DocumentValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Converts a key value into JSON, writing integral floats as integers.
fn canonical_json(value: &DocumentValue) -> Value {
    match value {
        DocumentValue::Number(number) => Value::Number(canonical_number(number)),
        DocumentValue::Array(values) => Value::Array(values.iter().map(canonical_json).collect()),
        DocumentValue::Document(document) => Value::Object(
            document
                .iter()
                .map(|(name, value)| (name.clone(), canonical_json(value)))
                .collect(),
        ),
        other => other.to_json(),
    }
}

fn canonical_number(number: &Number) -> Number {
    if number.is_i64() || number.is_u64() {
        return number.clone();
    }

    let Some(float) = number.as_f64() else {
        return number.clone();
    };
    if float.fract() != 0.0 || !(i64::MIN as f64..i64::MAX as f64).contains(&float) {
        return number.clone();
    }

    Number::from(float as i64)
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for RowKey {}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl Serialize for RowKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

/// Identity of a row across all destination tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowId {
    pub table: TableName,
    pub key: RowKey,
}

impl RowId {
    pub fn new(table: TableName, key: RowKey) -> Self {
        Self { table, key }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.table, self.key)
    }
}
