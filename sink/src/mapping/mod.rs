//! Turns routed documents into rows of a destination table.

mod column_mapper;

pub use column_mapper::{ColumnMapper, MappedRow};
