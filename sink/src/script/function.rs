use std::fmt;

use serde_json::Value;

use crate::error::SinkResult;
use crate::merge::MergeOperation;
use crate::types::Document;

/// A user function fanning one source document out to destination tables.
///
/// Returns either null, which discards the document, or an object mapping table names to
/// arrays of documents.
pub trait DispatchFunction: Send + Sync {
    fn dispatch(&self, doc: &Document, meta: &Document) -> SinkResult<Value>;
}

/// A user function rewriting or discarding a single row bound for a table.
///
/// Returns the document to upsert, or null to discard the mutation.
pub trait MapFunction: Send + Sync {
    fn map(&self, doc: &Document, meta: &Document) -> SinkResult<Value>;
}

/// A user function resolving a conflict on a table with compare-and-set columns.
///
/// Returns an object with exactly one of `apply`, `dlq`, or `drop`.
pub trait MergeFunction: Send + Sync {
    fn merge(&self, op: &MergeOperation) -> SinkResult<Value>;
}

impl<F> DispatchFunction for F
where
    F: Fn(&Document, &Document) -> SinkResult<Value> + Send + Sync,
{
    fn dispatch(&self, doc: &Document, meta: &Document) -> SinkResult<Value> {
        self(doc, meta)
    }
}

impl<F> MapFunction for F
where
    F: Fn(&Document, &Document) -> SinkResult<Value> + Send + Sync,
{
    fn map(&self, doc: &Document, meta: &Document) -> SinkResult<Value> {
        self(doc, meta)
    }
}

impl<F> MergeFunction for F
where
    F: Fn(&MergeOperation) -> SinkResult<Value> + Send + Sync,
{
    fn merge(&self, op: &MergeOperation) -> SinkResult<Value> {
        self(op)
    }
}

impl fmt::Debug for dyn DispatchFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DispatchFunction")
    }
}

impl fmt::Debug for dyn MapFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MapFunction")
    }
}

impl fmt::Debug for dyn MergeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MergeFunction")
    }
}
