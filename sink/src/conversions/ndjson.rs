//! Parsing of newline-delimited JSON changefeed payloads.
//!
//! Every line is an object of the form `{"after": ..., "before": ..., "key": [...], "updated":
//! "<hlc>"}`. A line whose `after` image is null or absent describes a deletion.

use serde::Deserialize;
use serde_json::Value;

use crate::bail;
use crate::error::{ErrorKind, SinkResult};
use crate::types::{Document, DocumentValue, Hlc, Mutation, TableName, source_meta};

/// Source kind recorded in the metadata of changefeed mutations.
pub const CHANGEFEED_SOURCE: &str = "cdc";

#[derive(Debug, Deserialize)]
struct ChangefeedLine {
    #[serde(default)]
    after: Option<Value>,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    key: Option<Value>,
    #[serde(default)]
    updated: Option<String>,
}

/// Decodes a single changefeed line into a [`Mutation`].
pub fn parse_ndjson_line(line: &[u8]) -> SinkResult<Mutation> {
    let payload: ChangefeedLine = serde_json::from_slice(line)?;

    let updated = match payload.updated.as_deref() {
        Some(updated) if !updated.is_empty() => updated,
        _ => bail!(
            ErrorKind::InvalidData,
            "Changefeed line has no timestamp",
            "CREATE CHANGEFEED must specify the 'WITH updated' option"
        ),
    };
    let time: Hlc = updated.parse()?;

    let key = match payload.key {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(values)) => values.into_iter().map(DocumentValue::from).collect(),
        Some(other) => bail!(
            ErrorKind::InvalidData,
            "Changefeed key is not an array",
            format!("found {}", DocumentValue::from(other).type_name())
        ),
    };

    let data = optional_document(payload.after)?;
    let before = optional_document(payload.before)?;

    Ok(Mutation {
        before,
        data,
        key,
        time,
        meta: Document::new(),
    })
}

/// Decodes a changefeed body for `table`, skipping blank lines.
///
/// Lines longer than `max_line_length` bytes are rejected. Every mutation receives the
/// changefeed's source metadata.
pub fn parse_ndjson(
    body: &str,
    table: &TableName,
    max_line_length: usize,
) -> SinkResult<Vec<Mutation>> {
    let mut mutations = Vec::new();

    for (index, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if line.len() > max_line_length {
            bail!(
                ErrorKind::InvalidData,
                "Changefeed line exceeds the buffer size",
                format!(
                    "line {} has {} bytes, the limit is {max_line_length}",
                    index + 1,
                    line.len()
                )
            );
        }

        let mut mutation = parse_ndjson_line(line.as_bytes())?;
        mutation.meta = source_meta(CHANGEFEED_SOURCE, table, mutation.time);
        mutations.push(mutation);
    }

    Ok(mutations)
}

fn optional_document(value: Option<Value>) -> SinkResult<Option<Document>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Document::try_from(value).map(Some),
    }
}
