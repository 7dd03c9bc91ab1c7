use crate::test_utils::document::table_name;
use crate::types::{ColumnSchema, TableSchema};

/// Builds a table schema whose first column is the primary key.
pub fn table_schema(name: &str, columns: &[&str]) -> TableSchema {
    let columns = columns
        .iter()
        .enumerate()
        .map(|(index, column)| ColumnSchema::new(*column, index == 0))
        .collect();

    TableSchema::new(table_name(name), columns)
}

/// Builds a table schema that keeps properties matching no column.
pub fn open_table_schema(name: &str, columns: &[&str]) -> TableSchema {
    let mut schema = table_schema(name, columns);
    schema.allow_unknown_columns = true;
    schema
}
