use std::collections::BTreeMap;

use serde_json::Value;

use crate::bail;
use crate::error::{ErrorKind, SinkResult};
use crate::script::{FunctionInvoker, FunctionKind, TableConfig};
use crate::types::{Document, DocumentValue, TableName, TableSchema};

/// A canonical row ready for the merge engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    pub row: Document,
    /// SQL expressions the store applies to the values of these columns.
    pub exprs: BTreeMap<String, String>,
}

/// Applies the per-table transformation pipeline.
///
/// The steps run in a fixed order: the user `map` function sees the document as routed, then
/// ignored columns are removed, then properties matching no column are moved into the extras
/// column, and finally expressions are attached to the columns that remain. A column that is
/// both ignored and has an expression is ignored.
#[derive(Debug)]
pub struct ColumnMapper<'a> {
    table: &'a TableName,
    config: &'a TableConfig,
    schema: &'a TableSchema,
    invoker: &'a FunctionInvoker,
}

impl<'a> ColumnMapper<'a> {
    pub fn new(
        table: &'a TableName,
        config: &'a TableConfig,
        schema: &'a TableSchema,
        invoker: &'a FunctionInvoker,
    ) -> Self {
        Self {
            table,
            config,
            schema,
            invoker,
        }
    }

    /// Maps a document into a row, or returns `None` if the `map` function discarded it.
    pub async fn map(&self, doc: Document, meta: &Document) -> SinkResult<Option<MappedRow>> {
        let Some(doc) = self.apply_map_function(doc, meta).await? else {
            return Ok(None);
        };

        let mut row = doc;
        row.retain(|name, _| !self.config.ignore.contains(name));

        let row = self.collect_extras(row)?;

        let exprs = self
            .config
            .exprs
            .iter()
            .filter(|(column, _)| row.contains(column))
            .map(|(column, expr)| (column.clone(), expr.clone()))
            .collect();

        Ok(Some(MappedRow { row, exprs }))
    }

    async fn apply_map_function(
        &self,
        doc: Document,
        meta: &Document,
    ) -> SinkResult<Option<Document>> {
        let Some(map) = self.config.map.clone() else {
            return Ok(Some(doc));
        };

        let meta = meta.clone();
        let value = self
            .invoker
            .invoke(FunctionKind::Map, move || map.map(&doc, &meta))
            .await?;

        match value {
            Value::Null => Ok(None),
            value => Document::try_from(value).map(Some),
        }
    }

    fn collect_extras(&self, row: Document) -> SinkResult<Document> {
        let is_known = |name: &str| self.schema.has_column(name);

        if row.names().all(is_known) {
            return Ok(row);
        }

        if let Some(extras_column) = &self.config.extras {
            let mut known = Document::new();
            let mut extras = Document::new();

            for (name, value) in row {
                if &name == extras_column {
                    match value {
                        DocumentValue::Document(existing) => extras.extend(existing),
                        DocumentValue::Null => {}
                        other => bail!(
                            ErrorKind::InvalidDocument,
                            "Extras column does not hold a document",
                            format!(
                                "{}.{extras_column}: found {}",
                                self.table,
                                other.type_name()
                            )
                        ),
                    }
                } else if is_known(&name) {
                    known.insert(name, value);
                } else {
                    extras.insert(name, value);
                }
            }

            known.insert(extras_column.clone(), extras);
            return Ok(known);
        }

        if self.schema.allow_unknown_columns {
            return Ok(row);
        }

        let unknown: Vec<String> = row
            .names()
            .filter(|name| !is_known(*name))
            .map(|name| format!("{}.{name}", self.table))
            .collect();
        bail!(
            ErrorKind::UnknownColumn,
            "Document has properties matching no column",
            unknown.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::types::ColumnSchema;

    fn doc(value: Value) -> Document {
        Document::try_from(value).unwrap()
    }

    fn schema(table: &TableName, columns: &[&str]) -> TableSchema {
        TableSchema::new(
            table.clone(),
            columns
                .iter()
                .map(|name| ColumnSchema::new(*name, *name == "pk"))
                .collect(),
        )
    }

    async fn map(
        config: &TableConfig,
        schema: &TableSchema,
        input: Value,
    ) -> SinkResult<Option<MappedRow>> {
        let invoker = FunctionInvoker::new(Duration::from_secs(1));
        ColumnMapper::new(&schema.name, config, schema, &invoker)
            .map(doc(input), &Document::new())
            .await
    }

    #[tokio::test]
    async fn known_columns_pass_through() {
        let table: TableName = "t".parse().unwrap();
        let config = TableConfig::default();

        let mapped = map(&config, &schema(&table, &["pk", "v"]), json!({"pk": 1, "v": "x"}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(mapped.row.to_json(), json!({"pk": 1, "v": "x"}));
        assert!(mapped.exprs.is_empty());
    }

    #[tokio::test]
    async fn unknown_columns_are_errors_without_extras() {
        let table: TableName = "t".parse().unwrap();
        let config = TableConfig::default();

        let err = map(&config, &schema(&table, &["pk"]), json!({"pk": 1, "surprise": 2}))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnknownColumn);
        assert_eq!(err.detail(), Some("t.surprise"));
    }

    #[tokio::test]
    async fn tolerant_tables_keep_unknown_columns() {
        let table: TableName = "t".parse().unwrap();
        let mut schema = schema(&table, &["pk"]);
        schema.allow_unknown_columns = true;

        let mapped = map(&TableConfig::default(), &schema, json!({"pk": 1, "surprise": 2}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(mapped.row.to_json(), json!({"pk": 1, "surprise": 2}));
    }

    #[tokio::test]
    async fn unknown_columns_go_to_extras() {
        let table: TableName = "t".parse().unwrap();
        let config = TableConfig {
            extras: Some("extras".to_string()),
            ..TableConfig::default()
        };

        let mapped = map(
            &config,
            &schema(&table, &["pk", "extras"]),
            json!({"pk": 1, "a": 2, "extras": {"b": 3}}),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(
            mapped.row.to_json(),
            json!({"pk": 1, "extras": {"a": 2, "b": 3}})
        );
    }

    #[tokio::test]
    async fn map_runs_before_ignore_and_exprs() {
        let table: TableName = "t".parse().unwrap();
        let rename = |doc: &Document, _: &Document| -> SinkResult<Value> {
            let mut out = doc.clone();
            if let Some(value) = out.remove("old") {
                out.insert("renamed", value);
            }
            Ok(out.to_json())
        };
        let config = TableConfig {
            ignore: ["secret".to_string()].into(),
            exprs: BTreeMap::from([
                ("renamed".to_string(), "lower($0)".to_string()),
                ("secret".to_string(), "md5($0)".to_string()),
            ]),
            map: Some(Arc::new(rename)),
            ..TableConfig::default()
        };

        let mapped = map(
            &config,
            &schema(&table, &["pk", "renamed"]),
            json!({"pk": 1, "old": "X", "secret": "s"}),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(mapped.row.to_json(), json!({"pk": 1, "renamed": "X"}));
        assert_eq!(
            mapped.exprs,
            BTreeMap::from([("renamed".to_string(), "lower($0)".to_string())])
        );
    }

    #[tokio::test]
    async fn map_returning_null_discards() {
        let table: TableName = "t".parse().unwrap();
        let discard = |_: &Document, _: &Document| -> SinkResult<Value> { Ok(Value::Null) };
        let config = TableConfig {
            map: Some(Arc::new(discard)),
            ..TableConfig::default()
        };

        let mapped = map(&config, &schema(&table, &["pk"]), json!({"pk": 1}))
            .await
            .unwrap();

        assert_eq!(mapped, None);
    }

    #[tokio::test]
    async fn map_returning_a_non_document_is_structural() {
        let table: TableName = "t".parse().unwrap();
        let scalar = |_: &Document, _: &Document| -> SinkResult<Value> { Ok(json!(42)) };
        let config = TableConfig {
            map: Some(Arc::new(scalar)),
            ..TableConfig::default()
        };

        let err = map(&config, &schema(&table, &["pk"]), json!({"pk": 1}))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidDocument);
    }
}
