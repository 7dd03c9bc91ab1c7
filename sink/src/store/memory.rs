use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, SinkResult};
use crate::store::{DlqEntry, ExpectedVersion, RowWrite, StoredRow, TargetStore, WriteOutcome};
use crate::types::{Document, RowId, RowKey, TableName, TableSchema};

#[derive(Debug, Default)]
struct Inner {
    schemas: HashMap<TableName, TableSchema>,
    rows: HashMap<TableName, HashMap<RowKey, StoredRow>>,
    expressions: HashMap<RowId, BTreeMap<String, String>>,
    dlq: Vec<DlqEntry>,
    last_version: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn table_rows(&mut self, table: &TableName) -> SinkResult<&mut HashMap<RowKey, StoredRow>> {
        if !self.schemas.contains_key(table) {
            bail!(
                ErrorKind::StoreError,
                "Table does not exist in the target store",
                table
            );
        }

        Ok(self.rows.entry(table.clone()).or_default())
    }
}

/// In-memory target store for testing and development purposes.
///
/// Tables must be created with [`MemoryTargetStore::create_table`] before rows are written to
/// them. Expressions attached to writes are recorded, not evaluated. All data is lost when the
/// process terminates.
#[derive(Debug, Clone, Default)]
pub struct MemoryTargetStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTargetStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a table. Existing rows of the table are kept.
    pub async fn create_table(&self, schema: TableSchema) {
        let mut inner = self.inner.lock().await;
        info!(table = %schema.name, "creating table");
        inner.schemas.insert(schema.name.clone(), schema);
    }

    /// Stores a row directly, bypassing every check. Returns its new version.
    pub async fn insert_row(
        &self,
        table: &TableName,
        key: RowKey,
        data: Document,
    ) -> SinkResult<u64> {
        let mut inner = self.inner.lock().await;
        let version = inner.next_version();
        inner
            .table_rows(table)?
            .insert(key, StoredRow { data, version });

        Ok(version)
    }

    /// Returns a copy of a row.
    pub async fn row(&self, table: &TableName, key: &RowKey) -> Option<Document> {
        let inner = self.inner.lock().await;
        inner
            .rows
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(|row| row.data.clone())
    }

    /// Returns a copy of every row of a table, ordered by key.
    pub async fn rows(&self, table: &TableName) -> Vec<Document> {
        let inner = self.inner.lock().await;
        let Some(rows) = inner.rows.get(table) else {
            return Vec::new();
        };

        let mut rows: Vec<(&RowKey, &StoredRow)> = rows.iter().collect();
        rows.sort_by_key(|(key, _)| key.to_string());
        rows.into_iter().map(|(_, row)| row.data.clone()).collect()
    }

    /// Returns the expressions recorded by the last write to a row.
    pub async fn row_expressions(
        &self,
        table: &TableName,
        key: &RowKey,
    ) -> BTreeMap<String, String> {
        let inner = self.inner.lock().await;
        inner
            .expressions
            .get(&RowId::new(table.clone(), key.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a copy of every dead-letter entry, in insertion order.
    pub async fn dlq_entries(&self) -> Vec<DlqEntry> {
        let inner = self.inner.lock().await;
        inner.dlq.clone()
    }

    /// Returns the dead-letter entries of one queue.
    pub async fn dlq(&self, queue: &str) -> Vec<DlqEntry> {
        let inner = self.inner.lock().await;
        inner
            .dlq
            .iter()
            .filter(|entry| entry.queue == queue)
            .cloned()
            .collect()
    }

    /// Removes every row and dead-letter entry. Tables are kept.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.rows.clear();
        inner.expressions.clear();
        inner.dlq.clear();
    }
}

impl TargetStore for MemoryTargetStore {
    async fn table_schema(&self, table: &TableName) -> SinkResult<Option<TableSchema>> {
        let inner = self.inner.lock().await;
        Ok(inner.schemas.get(table).cloned())
    }

    async fn read_row(&self, table: &TableName, key: &RowKey) -> SinkResult<Option<StoredRow>> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.get(table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn write_row(
        &self,
        table: &TableName,
        key: &RowKey,
        row: RowWrite,
        expected: ExpectedVersion,
    ) -> SinkResult<WriteOutcome> {
        let mut inner = self.inner.lock().await;
        let version = inner.next_version();
        let rows = inner.table_rows(table)?;

        let current = rows.get(key).map(|row| row.version);
        if !expected.matches(current) {
            debug!(table = %table, key = %key, ?expected, ?current, "row version mismatch");
            return Ok(WriteOutcome::VersionMismatch);
        }

        match rows.get_mut(key) {
            Some(stored) => {
                stored.data.extend(row.data);
                stored.version = version;
            }
            None => {
                rows.insert(
                    key.clone(),
                    StoredRow {
                        data: row.data,
                        version,
                    },
                );
            }
        }

        let id = RowId::new(table.clone(), key.clone());
        if row.exprs.is_empty() {
            inner.expressions.remove(&id);
        } else {
            inner.expressions.insert(id, row.exprs);
        }

        Ok(WriteOutcome::Written)
    }

    async fn delete_row(&self, table: &TableName, key: &RowKey) -> SinkResult<()> {
        let mut inner = self.inner.lock().await;
        inner.table_rows(table)?.remove(key);
        inner
            .expressions
            .remove(&RowId::new(table.clone(), key.clone()));

        Ok(())
    }

    async fn write_dlq(&self, entry: DlqEntry) -> SinkResult<()> {
        let mut inner = self.inner.lock().await;
        info!(queue = %entry.queue, source = %entry.source, "writing dead-letter entry");
        inner.dlq.push(entry);

        Ok(())
    }
}
