use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::SinkResult;
use crate::store::memory::MemoryTargetStore;
use crate::store::{DlqEntry, ExpectedVersion, RowWrite, StoredRow, TargetStore, WriteOutcome};
use crate::types::{Document, RowKey, TableName, TableSchema};

/// A [`MemoryTargetStore`] wrapper simulating a concurrent writer.
///
/// The first `races` conditional writes to an existing row are preceded by a write of
/// `interference` to the same row, so the conditional write finds a newer version than the one
/// the engine read.
#[derive(Debug, Clone)]
pub struct RacingStore {
    inner: MemoryTargetStore,
    races: Arc<AtomicUsize>,
    interference: Document,
}

impl RacingStore {
    pub fn new(inner: MemoryTargetStore, races: usize, interference: Document) -> Self {
        Self {
            inner,
            races: Arc::new(AtomicUsize::new(races)),
            interference,
        }
    }

    pub fn inner(&self) -> &MemoryTargetStore {
        &self.inner
    }

    /// Returns how many interfering writes are still pending.
    pub fn remaining_races(&self) -> usize {
        self.races.load(Ordering::SeqCst)
    }

    fn take_race(&self) -> bool {
        self.races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |races| races.checked_sub(1))
            .is_ok()
    }
}

impl TargetStore for RacingStore {
    async fn table_schema(&self, table: &TableName) -> SinkResult<Option<TableSchema>> {
        self.inner.table_schema(table).await
    }

    async fn read_row(&self, table: &TableName, key: &RowKey) -> SinkResult<Option<StoredRow>> {
        self.inner.read_row(table, key).await
    }

    async fn write_row(
        &self,
        table: &TableName,
        key: &RowKey,
        row: RowWrite,
        expected: ExpectedVersion,
    ) -> SinkResult<WriteOutcome> {
        if matches!(expected, ExpectedVersion::Exactly(_))
            && let Some(mut current) = self.inner.row(table, key).await
            && self.take_race()
        {
            current.extend(self.interference.clone());
            self.inner.insert_row(table, key.clone(), current).await?;
        }

        self.inner.write_row(table, key, row, expected).await
    }

    async fn delete_row(&self, table: &TableName, key: &RowKey) -> SinkResult<()> {
        self.inner.delete_row(table, key).await
    }

    async fn write_dlq(&self, entry: DlqEntry) -> SinkResult<()> {
        self.inner.write_dlq(entry).await
    }
}
