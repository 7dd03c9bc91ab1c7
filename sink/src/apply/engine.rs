use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use metrics::counter;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::apply::outcome::{Disposition, DropReason, MutationOutcome};
use crate::apply::policy::{FailureAction, build_disposition_policy};
use crate::concurrency::row_lock::RowLocks;
use crate::conversions::ndjson::parse_ndjson;
use crate::deadline::check_deadlines;
use crate::error::{ErrorKind, SinkError, SinkResult};
use crate::mapping::{ColumnMapper, MappedRow};
use crate::merge::{MergeFailure, MergeOperation, Proposal, Resolution, is_conflict, resolve};
use crate::metrics::{
    QUEUE_LABEL, REASON_LABEL, SINK_MUTATIONS_APPLIED_TOTAL, SINK_MUTATIONS_DELETED_TOTAL,
    SINK_MUTATIONS_DLQ_TOTAL, SINK_MUTATIONS_DROPPED_TOTAL, TABLE_NAME_LABEL, register_metrics,
};
use crate::routing::{RoutedMutation, Router};
use crate::script::{FunctionInvoker, Registry, SourceDestination, TableConfig};
use crate::store::{DlqEntry, ExpectedVersion, RowWrite, TargetStore, WriteOutcome};
use crate::types::{Document, Mutation, RowId, RowKey, TableName, TableSchema};
use crate::{bail, sink_error};

/// What a prepared mutation does to its row.
#[derive(Debug)]
enum RowAction {
    /// `before` is the unmapped before image, mapped only if a merge needs it.
    Upsert {
        row: MappedRow,
        before: Option<Document>,
    },
    Delete,
}

/// A mutation that passed routing, mapping and deadlines, keyed by its destination row.
#[derive(Debug)]
struct PreparedMutation {
    seq: usize,
    index: usize,
    table: TableName,
    key: RowKey,
    mutation: Mutation,
    action: RowAction,
}

#[derive(Debug)]
enum Prepared {
    Ready(PreparedMutation),
    Dropped(DropReason),
}

/// The mutation-application engine.
///
/// An [`Engine`] owns the configuration built from the user script and the store holding the
/// destination tables. It is shared by every batch, and batches may be processed concurrently:
/// mutations for the same row are serialized by row locks, while the read, merge and write of a
/// row are additionally guarded by a version check at write time.
#[derive(Debug)]
pub struct Engine<S> {
    registry: Arc<Registry>,
    store: S,
    invoker: FunctionInvoker,
    locks: RowLocks,
    schemas: RwLock<HashMap<TableName, Arc<TableSchema>>>,
}

impl<S> Engine<S>
where
    S: TargetStore + Send + Sync,
{
    /// Creates an engine after checking the configuration against the store.
    ///
    /// Every configured table must exist and every column it references must be a column of
    /// the table. Source targets and delete targets must exist as well. All problems are
    /// reported at once.
    pub async fn new(registry: Registry, store: S) -> SinkResult<Self> {
        register_metrics();
        registry.options().validate()?;

        let options = registry.options();
        let engine = Self {
            invoker: FunctionInvoker::new(options.user_function_timeout),
            locks: RowLocks::new(options.row_lock_shards),
            registry: Arc::new(registry),
            store,
            schemas: RwLock::new(HashMap::new()),
        };
        engine.validate_configuration().await?;

        info!(
            sources = engine.registry.sources().count(),
            tables = engine.registry.tables().count(),
            "mutation engine ready"
        );

        Ok(engine)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn validate_configuration(&self) -> SinkResult<()> {
        let mut errors = Vec::new();

        for (table, config) in self.registry.tables() {
            match self.table_schema(table).await {
                Ok(schema) => {
                    for column in config.referenced_columns() {
                        if !schema.has_column(column) {
                            errors.push(sink_error!(
                                ErrorKind::UnknownColumn,
                                "Table configuration references an unknown column",
                                format!("{table}.{column}")
                            ));
                        }
                    }
                }
                Err(err) => errors.push(err),
            }
        }

        for source in self.registry.sources() {
            let table = match &source.destination {
                SourceDestination::Target(table) => Some(table),
                SourceDestination::Dispatch { deletes_to, .. } => deletes_to.as_ref(),
            };
            if let Some(table) = table
                && let Err(err) = self.table_schema(table).await
            {
                errors.push(err);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    /// Parses an ndjson changefeed body for `table` and processes it as one batch.
    ///
    /// The table name doubles as the source name, so unconfigured tables pass through.
    pub async fn process_ndjson(
        &self,
        table: &TableName,
        body: &str,
    ) -> SinkResult<Vec<MutationOutcome>> {
        let mutations = parse_ndjson(body, table, self.registry.options().ndjson_buffer_size)?;

        self.process_batch(&table.to_string(), mutations).await
    }

    /// Applies a batch of mutations received from `source`.
    ///
    /// Returns one outcome per mutation produced by routing, in batch order. A mutation that
    /// routing discards still yields a single outcome. Failures confined to one mutation are
    /// recorded in its outcome; configuration and storage errors fail the whole batch, and
    /// writes already performed for other rows are kept.
    pub async fn process_batch(
        &self,
        source: &str,
        mutations: Vec<Mutation>,
    ) -> SinkResult<Vec<MutationOutcome>> {
        let source = self.registry.source(source)?;
        let options = self.registry.options();
        let parallelism = options.apply_parallelism;
        let batch_size = mutations.len();

        let router = Router::new(&source, &self.invoker, options.max_recursion_depth);
        let router = &router;

        let routed: Vec<_> = stream::iter(mutations.into_iter().enumerate())
            .map(|(index, mutation)| async move {
                let result = router.route(mutation.clone()).await;
                (index, mutation, result)
            })
            .buffered(parallelism)
            .collect()
            .await;

        let mut outcomes = Vec::new();
        let mut pending = Vec::new();
        let mut seq = 0;
        for (index, mutation, result) in routed {
            match result {
                Ok(routed) if routed.is_empty() => {
                    debug!(source = %source.name, index, "mutation discarded by dispatch");
                    let disposition = Disposition::Dropped {
                        reason: DropReason::Discarded,
                    };
                    outcomes.push((seq, self.outcome(index, None, None, disposition)));
                    seq += 1;
                }
                Ok(routed) => {
                    for routed in routed {
                        pending.push((seq, index, routed));
                        seq += 1;
                    }
                }
                Err(err) => {
                    let disposition = self
                        .handle_failure(&source.name, None, &mutation, None, err)
                        .await?;
                    outcomes.push((seq, self.outcome(index, None, None, disposition)));
                    seq += 1;
                }
            }
        }

        let prepared: Vec<_> = stream::iter(pending)
            .map(|(seq, index, routed)| async move {
                let result = self.prepare(seq, index, &routed).await;
                (seq, index, routed, result)
            })
            .buffered(parallelism)
            .collect()
            .await;

        let mut groups: Vec<Vec<PreparedMutation>> = Vec::new();
        let mut group_of_row: HashMap<RowId, usize> = HashMap::new();
        for (seq, index, routed, result) in prepared {
            let RoutedMutation { table, mutation } = routed;
            match result {
                Ok(Prepared::Ready(prepared)) => {
                    let row = RowId::new(prepared.table.clone(), prepared.key.clone());
                    let group = *group_of_row.entry(row).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[group].push(prepared);
                }
                Ok(Prepared::Dropped(reason)) => {
                    let disposition = Disposition::Dropped { reason };
                    outcomes.push((seq, self.outcome(index, Some(table), None, disposition)));
                }
                Err(err) => {
                    let disposition = self
                        .handle_failure(&source.name, Some(&table), &mutation, None, err)
                        .await?;
                    outcomes.push((seq, self.outcome(index, Some(table), None, disposition)));
                }
            }
        }

        let applied: Vec<Vec<(usize, MutationOutcome)>> = stream::iter(groups)
            .map(|group| self.apply_group(&source.name, group))
            .buffer_unordered(parallelism)
            .try_collect()
            .await?;

        outcomes.extend(applied.into_iter().flatten());
        outcomes.sort_by_key(|(seq, _)| *seq);

        debug!(
            source = %source.name,
            mutations = batch_size,
            outcomes = outcomes.len(),
            "batch processed"
        );

        Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
    }

    /// Maps a routed mutation into a row and checks its deadlines.
    ///
    /// The `map` function runs once on the after image here. The before image is left
    /// unmapped until a merge needs it, see [`Engine::apply_upsert`].
    async fn prepare(
        &self,
        seq: usize,
        index: usize,
        routed: &RoutedMutation,
    ) -> SinkResult<Prepared> {
        let RoutedMutation { table, mutation } = routed;

        let Some(data) = mutation.data.clone() else {
            if mutation.key.is_empty() {
                bail!(
                    ErrorKind::MissingPrimaryKey,
                    "Delete carries no primary key",
                    table.to_string()
                );
            }

            return Ok(Prepared::Ready(PreparedMutation {
                seq,
                index,
                table: table.clone(),
                key: RowKey::new(mutation.key.clone()),
                mutation: mutation.clone(),
                action: RowAction::Delete,
            }));
        };

        let config = self.registry.table(table);
        let schema = self.table_schema(table).await?;
        let mapper = ColumnMapper::new(table, &config, &schema, &self.invoker);

        let Some(row) = mapper.map(data, &mutation.meta).await? else {
            debug!(table = %table, index, "mutation discarded by map function");
            return Ok(Prepared::Dropped(DropReason::Discarded));
        };

        if let Some(expired) = check_deadlines(&config.deadlines, &row.row, Utc::now())? {
            debug!(
                table = %table,
                column = %expired.column,
                age = ?expired.age,
                max_age = ?expired.max_age,
                "mutation dropped, deadline exceeded"
            );
            return Ok(Prepared::Dropped(DropReason::Deadline));
        }

        let key = row_key(&schema, table, &row.row, mutation)?;

        Ok(Prepared::Ready(PreparedMutation {
            seq,
            index,
            table: table.clone(),
            key,
            mutation: mutation.clone(),
            action: RowAction::Upsert {
                row,
                before: mutation.before.clone(),
            },
        }))
    }

    /// Applies the mutations of one row in order while holding the row's lock.
    async fn apply_group(
        &self,
        source: &str,
        group: Vec<PreparedMutation>,
    ) -> SinkResult<Vec<(usize, MutationOutcome)>> {
        let Some(first) = group.first() else {
            return Ok(Vec::new());
        };

        let row = RowId::new(first.table.clone(), first.key.clone());
        let _guard = self.locks.lock(&row).await;

        let mut outcomes = Vec::with_capacity(group.len());
        for prepared in group {
            let disposition = match self.apply_one(source, &prepared).await {
                Ok(disposition) => disposition,
                Err(err) => {
                    self.handle_failure(
                        source,
                        Some(&prepared.table),
                        &prepared.mutation,
                        None,
                        err,
                    )
                    .await?
                }
            };

            let outcome = self.outcome(
                prepared.index,
                Some(prepared.table),
                Some(prepared.key),
                disposition,
            );
            outcomes.push((prepared.seq, outcome));
        }

        Ok(outcomes)
    }

    async fn apply_one(&self, source: &str, prepared: &PreparedMutation) -> SinkResult<Disposition> {
        let PreparedMutation {
            table, key, action, ..
        } = prepared;

        match action {
            RowAction::Delete => {
                self.store.delete_row(table, key).await?;
                Ok(Disposition::Deleted)
            }
            RowAction::Upsert { row, before } => {
                self.apply_upsert(source, prepared, row, before.as_ref())
                    .await
            }
        }
    }

    /// Writes a row, merging it with the current target row on compare-and-set tables.
    ///
    /// When the target row changes between reading and writing it, the row is read and merged
    /// again, up to `stale_write_retries` times. The before image goes through the `map`
    /// function at most once, and only when the row conflicts with a table that has a merge
    /// strategy.
    async fn apply_upsert(
        &self,
        source: &str,
        prepared: &PreparedMutation,
        row: &MappedRow,
        before: Option<&Document>,
    ) -> SinkResult<Disposition> {
        let PreparedMutation {
            table,
            key,
            mutation,
            ..
        } = prepared;
        let config = self.registry.table(table);
        let attempts = self.registry.options().stale_write_retries + 1;
        let mut mapped_before: Option<Option<Document>> = None;

        for attempt in 1..=attempts {
            let (data, expected) = if config.is_cas() {
                let current = self.store.read_row(table, key).await?;
                let target = current.as_ref().map(|current| &current.data);

                if mapped_before.is_none()
                    && config.merge.is_some()
                    && let Some(before) = before
                    && let Some(target) = target
                    && is_conflict(&config.cas, &row.row, target)
                {
                    let mapped = self
                        .map_before(table, &config, before.clone(), &mutation.meta)
                        .await?;
                    mapped_before = Some(mapped);
                }

                let proposal = Proposal {
                    table,
                    proposed: &row.row,
                    before: mapped_before.as_ref().and_then(Option::as_ref),
                    meta: &mutation.meta,
                };

                match resolve(&config, proposal, target, &self.invoker).await {
                    Ok(Resolution::Apply(data)) => (data, ExpectedVersion::of(current.as_ref())),
                    Ok(Resolution::Dlq { queue, operation }) => {
                        info!(
                            table = %table,
                            key = %key,
                            queue = %queue,
                            "merge routed mutation to dead-letter queue"
                        );
                        self.dead_letter(&queue, source, Some(table), mutation, Some(operation), None)
                            .await?;
                        return Ok(Disposition::Dlq { queue });
                    }
                    Ok(Resolution::Drop { reason, .. }) => {
                        debug!(table = %table, key = %key, %reason, "mutation dropped by merge");
                        return Ok(Disposition::Dropped { reason });
                    }
                    Err(MergeFailure { error, operation }) => {
                        error!(
                            table = %table,
                            key = %key,
                            error = %error,
                            operation = %serde_json::to_string(&operation).unwrap_or_default(),
                            "merge function failed"
                        );
                        return self
                            .handle_failure(source, Some(table), mutation, Some(operation), error)
                            .await;
                    }
                }
            } else {
                (row.row.clone(), ExpectedVersion::Any)
            };

            let write = RowWrite {
                data,
                exprs: row.exprs.clone(),
            };
            match self.store.write_row(table, key, write, expected).await? {
                WriteOutcome::Written => return Ok(Disposition::Applied),
                WriteOutcome::VersionMismatch => {
                    debug!(table = %table, key = %key, attempt, "target row changed, retrying");
                }
            }
        }

        Err(sink_error!(
            ErrorKind::StaleWrite,
            "Target row kept changing between read and write",
            format!("{table} {key} after {attempts} attempts")
        ))
    }

    async fn map_before(
        &self,
        table: &TableName,
        config: &TableConfig,
        before: Document,
        meta: &Document,
    ) -> SinkResult<Option<Document>> {
        let schema = self.table_schema(table).await?;
        let mapper = ColumnMapper::new(table, config, &schema, &self.invoker);

        Ok(mapper.map(before, meta).await?.map(|mapped| mapped.row))
    }

    /// Disposes of a mutation whose processing failed, according to the error's policy.
    async fn handle_failure(
        &self,
        source: &str,
        table: Option<&TableName>,
        mutation: &Mutation,
        operation: Option<MergeOperation>,
        err: SinkError,
    ) -> SinkResult<Disposition> {
        let policy = build_disposition_policy(&err);
        let table_name = table.map(ToString::to_string).unwrap_or_default();

        match policy.action() {
            FailureAction::Fatal => {
                error!(
                    source,
                    table = %table_name,
                    error = %err,
                    solution = policy.solution().unwrap_or_default(),
                    "mutation failed, aborting batch"
                );
                Err(err)
            }
            FailureAction::Drop => {
                warn!(
                    source,
                    table = %table_name,
                    error = %err,
                    "mutation cannot be applied, dropping it"
                );
                Ok(Disposition::Dropped {
                    reason: DropReason::Invalid,
                })
            }
            FailureAction::Dlq => {
                let queue = self.registry.options().default_dlq.clone();
                warn!(
                    source,
                    table = %table_name,
                    queue = %queue,
                    error = %err,
                    "mutation failed, sending it to the dead-letter queue"
                );
                self.dead_letter(&queue, source, table, mutation, operation, Some(&err))
                    .await?;
                Ok(Disposition::Dlq { queue })
            }
        }
    }

    async fn dead_letter(
        &self,
        queue: &str,
        source: &str,
        table: Option<&TableName>,
        mutation: &Mutation,
        operation: Option<MergeOperation>,
        err: Option<&SinkError>,
    ) -> SinkResult<()> {
        let entry = DlqEntry {
            queue: queue.to_string(),
            source: source.to_string(),
            table: table.cloned(),
            kind: mutation.kind(),
            key: RowKey::new(mutation.key.clone()),
            time: mutation.time,
            data: mutation.data.clone(),
            before: mutation.before.clone(),
            meta: mutation.meta.clone(),
            operation,
            error: err.map(ToString::to_string),
        };

        self.store.write_dlq(entry).await
    }

    /// Builds an outcome and records it in the metrics.
    fn outcome(
        &self,
        index: usize,
        table: Option<TableName>,
        key: Option<RowKey>,
        disposition: Disposition,
    ) -> MutationOutcome {
        let table_name = table.as_ref().map(ToString::to_string).unwrap_or_default();

        match &disposition {
            Disposition::Applied => {
                counter!(SINK_MUTATIONS_APPLIED_TOTAL, TABLE_NAME_LABEL => table_name).increment(1);
            }
            Disposition::Deleted => {
                counter!(SINK_MUTATIONS_DELETED_TOTAL, TABLE_NAME_LABEL => table_name).increment(1);
            }
            Disposition::Dlq { queue } => {
                counter!(
                    SINK_MUTATIONS_DLQ_TOTAL,
                    TABLE_NAME_LABEL => table_name,
                    QUEUE_LABEL => queue.clone()
                )
                .increment(1);
            }
            Disposition::Dropped { reason } => {
                counter!(
                    SINK_MUTATIONS_DROPPED_TOTAL,
                    TABLE_NAME_LABEL => table_name,
                    REASON_LABEL => reason.as_str()
                )
                .increment(1);
            }
        }

        MutationOutcome {
            index,
            table,
            key,
            disposition,
        }
    }

    async fn table_schema(&self, table: &TableName) -> SinkResult<Arc<TableSchema>> {
        if let Some(schema) = self.schemas.read().await.get(table) {
            return Ok(schema.clone());
        }

        let Some(schema) = self.store.table_schema(table).await? else {
            bail!(
                ErrorKind::MissingTableSchema,
                "Destination table does not exist",
                table.to_string()
            );
        };

        let schema = Arc::new(schema);
        self.schemas
            .write()
            .await
            .insert(table.clone(), schema.clone());

        Ok(schema)
    }
}

/// Extracts the primary key of a row from its primary key columns.
///
/// Tables without primary key columns are keyed by the source key.
fn row_key(
    schema: &TableSchema,
    table: &TableName,
    row: &Document,
    mutation: &Mutation,
) -> SinkResult<RowKey> {
    let mut values = Vec::new();
    for column in schema.primary_key() {
        match row.get(column) {
            Some(value) if !value.is_null() => values.push(value.clone()),
            _ => bail!(
                ErrorKind::MissingPrimaryKey,
                "Row is missing a primary key column",
                format!("{table}.{column}")
            ),
        }
    }

    if values.is_empty() {
        if mutation.key.is_empty() {
            bail!(
                ErrorKind::MissingPrimaryKey,
                "Row has no primary key",
                table.to_string()
            );
        }
        values = mutation.key.clone();
    }

    Ok(RowKey::new(values))
}
