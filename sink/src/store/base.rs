use std::collections::BTreeMap;
use std::future::Future;

use serde::Serialize;

use crate::error::SinkResult;
use crate::merge::MergeOperation;
use crate::types::{Document, Hlc, MutationKind, RowKey, TableName, TableSchema};

/// Version of a stored row. Every write to a row produces a new version.
pub type RowVersion = u64;

/// A row read from the target store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub data: Document,
    pub version: RowVersion,
}

/// The version a conditional write expects to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Write unconditionally.
    Any,
    /// The row must not exist.
    Absent,
    /// The row must exist at exactly this version.
    Exactly(RowVersion),
}

impl ExpectedVersion {
    /// Returns the expectation matching what was read.
    pub fn of(row: Option<&StoredRow>) -> Self {
        match row {
            Some(row) => ExpectedVersion::Exactly(row.version),
            None => ExpectedVersion::Absent,
        }
    }

    pub fn matches(&self, current: Option<RowVersion>) -> bool {
        match (self, current) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Exactly(expected), Some(current)) => *expected == current,
            _ => false,
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The row changed since it was read. Nothing was written.
    VersionMismatch,
}

/// A row to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub data: Document,
    /// SQL expressions for some columns, with `$0` standing for the column's value.
    pub exprs: BTreeMap<String, String>,
}

/// A mutation parked for offline handling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqEntry {
    pub queue: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableName>,
    pub kind: MutationKind,
    pub key: RowKey,
    pub time: Hlc,
    pub data: Option<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Document>,
    pub meta: Document,
    /// The merge the mutation was part of, if it reached the merge engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<MergeOperation>,
    /// Why the mutation was parked, when it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Trait for stores holding the destination tables.
///
/// [`TargetStore`] implementations perform the actual reads and writes decided by the engine.
/// Writes are conditional on the row version, which lets the engine detect rows that changed
/// between reading and writing them.
pub trait TargetStore {
    /// Returns the schema of a table, or `None` if the table does not exist.
    fn table_schema(
        &self,
        table: &TableName,
    ) -> impl Future<Output = SinkResult<Option<TableSchema>>> + Send;

    /// Reads the current row with the given key.
    fn read_row(
        &self,
        table: &TableName,
        key: &RowKey,
    ) -> impl Future<Output = SinkResult<Option<StoredRow>>> + Send;

    /// Upserts a row if its version matches `expected`.
    ///
    /// Columns absent from the write keep their stored values.
    fn write_row(
        &self,
        table: &TableName,
        key: &RowKey,
        row: RowWrite,
        expected: ExpectedVersion,
    ) -> impl Future<Output = SinkResult<WriteOutcome>> + Send;

    /// Deletes a row. Deleting a missing row succeeds.
    fn delete_row(
        &self,
        table: &TableName,
        key: &RowKey,
    ) -> impl Future<Output = SinkResult<()>> + Send;

    /// Appends an entry to a dead-letter queue.
    fn write_dlq(&self, entry: DlqEntry) -> impl Future<Output = SinkResult<()>> + Send;
}
