use crate::types::TableName;

/// A column of a destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub primary_key: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, primary_key: bool) -> Self {
        Self {
            name: name.into(),
            primary_key,
        }
    }
}

/// The shape of a destination table as reported by the target store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: TableName,
    /// Columns in table order. Primary key columns keep their relative order.
    pub columns: Vec<ColumnSchema>,
    /// Whether the table accepts properties that match no column.
    pub allow_unknown_columns: bool,
}

impl TableSchema {
    pub fn new(name: TableName, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name,
            columns,
            allow_unknown_columns: false,
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column.name == name)
    }

    /// Returns the primary key column names in table order.
    pub fn primary_key(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|column| column.primary_key)
            .map(|column| column.name.as_str())
    }
}
