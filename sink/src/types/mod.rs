//! Core data types shared by every stage of the sink.
//!
//! Documents and their values, table identifiers, source mutations, and hybrid logical clock
//! timestamps.

mod document;
mod hlc;
mod ident;
mod mutation;
mod schema;

pub use document::{Document, DocumentValue};
pub use hlc::Hlc;
pub use ident::TableName;
pub use mutation::{
    META_SOURCE_KEY, META_TABLE_KEY, META_UPDATED_KEY, Mutation, MutationKind, RowId, RowKey,
    source_meta,
};
pub use schema::{ColumnSchema, TableSchema};
