use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{ErrorKind, SinkError, SinkResult};
use crate::sink_error;

/// A loosely-typed bag of named values.
///
/// [`Document`] is the unit exchanged between the replication source, user functions, and
/// the target store. Property order carries no meaning, so properties are kept sorted, which
/// makes rendering and comparison deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    properties: BTreeMap<String, DocumentValue>,
}

/// A value held by a [`Document`] property: any JSON-compatible value.
///
/// The type is a tree; children are owned, so a document can never contain itself.
#[derive(Debug, Clone)]
pub enum DocumentValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Document(Document),
    Array(Vec<DocumentValue>),
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of a property.
    pub fn get(&self, name: &str) -> Option<&DocumentValue> {
        self.properties.get(name)
    }

    /// Sets a property, returning the previous value.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<DocumentValue>,
    ) -> Option<DocumentValue> {
        self.properties.insert(name.into(), value.into())
    }

    /// Removes a property, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<DocumentValue> {
        self.properties.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Iterates over the property names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Iterates over properties in sorted order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, DocumentValue> {
        self.properties.iter()
    }

    /// Keeps only the properties for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &DocumentValue) -> bool) {
        self.properties.retain(|name, value| keep(name, value));
    }

    /// Returns `true` if every property of `self` has an equal value in `other`.
    pub fn is_subset_of(&self, other: &Document) -> bool {
        self.iter()
            .all(|(name, value)| other.get(name).is_some_and(|existing| existing == value))
    }

    /// Overlays the properties of `other` on top of `self`.
    pub fn extend(&mut self, other: Document) {
        self.properties.extend(other.properties);
    }

    /// Converts the document into a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}

impl DocumentValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DocumentValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DocumentValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            DocumentValue::Document(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DocumentValue::Number(value) => value.as_f64(),
            _ => None,
        }
    }

    /// Returns a short name for the value's type, used in error details.
    pub fn type_name(&self) -> &'static str {
        match self {
            DocumentValue::Null => "null",
            DocumentValue::Bool(_) => "boolean",
            DocumentValue::Number(_) => "number",
            DocumentValue::String(_) => "string",
            DocumentValue::Document(_) => "document",
            DocumentValue::Array(_) => "array",
        }
    }

    /// Converts the value into JSON.
    pub fn to_json(&self) -> Value {
        match self {
            DocumentValue::Null => Value::Null,
            DocumentValue::Bool(value) => Value::Bool(*value),
            DocumentValue::Number(value) => Value::Number(value.clone()),
            DocumentValue::String(value) => Value::String(value.clone()),
            DocumentValue::Document(value) => value.to_json(),
            DocumentValue::Array(values) => {
                Value::Array(values.iter().map(DocumentValue::to_json).collect())
            }
        }
    }
}

/// Numbers are equal when they denote the same value, so `1` and `1.0` compare equal.
impl PartialEq for DocumentValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DocumentValue::Null, DocumentValue::Null) => true,
            (DocumentValue::Bool(a), DocumentValue::Bool(b)) => a == b,
            (DocumentValue::Number(a), DocumentValue::Number(b)) => numbers_equal(a, b),
            (DocumentValue::String(a), DocumentValue::String(b)) => a == b,
            (DocumentValue::Document(a), DocumentValue::Document(b)) => a == b,
            (DocumentValue::Array(a), DocumentValue::Array(b)) => a == b,
            _ => false,
        }
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a == b;
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl From<Value> for DocumentValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => DocumentValue::Null,
            Value::Bool(value) => DocumentValue::Bool(value),
            Value::Number(value) => DocumentValue::Number(value),
            Value::String(value) => DocumentValue::String(value),
            Value::Array(values) => {
                DocumentValue::Array(values.into_iter().map(DocumentValue::from).collect())
            }
            Value::Object(map) => DocumentValue::Document(Document {
                properties: map
                    .into_iter()
                    .map(|(name, value)| (name, DocumentValue::from(value)))
                    .collect(),
            }),
        }
    }
}

impl From<bool> for DocumentValue {
    fn from(value: bool) -> Self {
        DocumentValue::Bool(value)
    }
}

impl From<i64> for DocumentValue {
    fn from(value: i64) -> Self {
        DocumentValue::Number(value.into())
    }
}

impl From<&str> for DocumentValue {
    fn from(value: &str) -> Self {
        DocumentValue::String(value.to_string())
    }
}

impl From<String> for DocumentValue {
    fn from(value: String) -> Self {
        DocumentValue::String(value)
    }
}

impl From<Document> for DocumentValue {
    fn from(value: Document) -> Self {
        DocumentValue::Document(value)
    }
}

/// Validates that a script value is a document.
///
/// Only JSON objects are documents; every other value is a structural error.
impl TryFrom<Value> for Document {
    type Error = SinkError;

    fn try_from(value: Value) -> SinkResult<Self> {
        match DocumentValue::from(value) {
            DocumentValue::Document(document) => Ok(document),
            other => Err(sink_error!(
                ErrorKind::InvalidDocument,
                "Value is not a document",
                format!("expected an object, found {}", other.type_name())
            )),
        }
    }
}

impl FromIterator<(String, DocumentValue)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, DocumentValue)>>(iter: T) -> Self {
        Document {
            properties: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Document {
    type Item = (String, DocumentValue);
    type IntoIter = btree_map::IntoIter<String, DocumentValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.properties.into_iter()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl fmt::Display for DocumentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.properties.len()))?;
        for (name, value) in &self.properties {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl Serialize for DocumentValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DocumentValue::Null => serializer.serialize_unit(),
            DocumentValue::Bool(value) => serializer.serialize_bool(*value),
            DocumentValue::Number(value) => value.serialize(serializer),
            DocumentValue::String(value) => serializer.serialize_str(value),
            DocumentValue::Document(value) => value.serialize(serializer),
            DocumentValue::Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for value in values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for DocumentValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(DocumentValue::from)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Document::try_from(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numbers_compare_by_value() {
        assert_eq!(
            DocumentValue::from(json!(1)),
            DocumentValue::from(json!(1.0))
        );
        assert_ne!(DocumentValue::from(json!(1)), DocumentValue::from(json!(2)));
        assert_ne!(DocumentValue::from(json!(1)), DocumentValue::from(json!("1")));
    }

    #[test]
    fn only_objects_are_documents() {
        assert!(Document::try_from(json!({"a": [1, {"b": null}]})).is_ok());

        let err = Document::try_from(json!([1, 2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDocument);
        assert_eq!(err.detail(), Some("expected an object, found array"));
    }

    #[test]
    fn json_conversion_preserves_nested_values() {
        let value = json!({"a": 1, "b": {"c": [true, "x", null]}});
        let document = Document::try_from(value.clone()).unwrap();

        assert_eq!(document.to_json(), value);
        assert_eq!(serde_json::to_value(&document).unwrap(), value);
    }

    #[test]
    fn subset_requires_equal_values() {
        let small = Document::try_from(json!({"a": 1})).unwrap();
        let large = Document::try_from(json!({"a": 1.0, "b": 2})).unwrap();
        let other = Document::try_from(json!({"a": 2, "b": 2})).unwrap();

        assert!(small.is_subset_of(&large));
        assert!(!small.is_subset_of(&other));
        assert!(!large.is_subset_of(&small));
    }
}
