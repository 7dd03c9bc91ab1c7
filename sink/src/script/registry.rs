use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use config::shared::SinkOptions;

use crate::error::SinkResult;
use crate::merge::MergeStrategy;
use crate::script::{DispatchFunction, MapFunction};
use crate::types::TableName;

/// Where the documents of a source are sent.
#[derive(Debug, Clone)]
pub enum SourceDestination {
    /// A user function fans documents out to any number of tables. Deletes go to
    /// `deletes_to`.
    Dispatch {
        dispatch: Arc<dyn DispatchFunction>,
        deletes_to: Option<TableName>,
    },
    /// Every document is sent unchanged to a single table.
    Target(TableName),
}

/// Routing configuration of a replication source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub destination: SourceDestination,
    /// Whether nested documents are detached and routed on their own.
    pub recurse: bool,
}

/// Behavior of a destination table.
///
/// A table without registered configuration behaves like [`TableConfig::default`]: rows are
/// upserted as they arrive.
#[derive(Debug, Clone, Default)]
pub struct TableConfig {
    /// Compare-and-set columns in comparison order.
    pub cas: Vec<String>,
    /// Maximum age of a mutation, keyed by the timestamp column holding its age.
    pub deadlines: BTreeMap<String, Duration>,
    /// SQL expressions applied to column values by the store. `$0` stands for the value.
    pub exprs: BTreeMap<String, String>,
    /// JSON column collecting properties that match no column.
    pub extras: Option<String>,
    pub ignore: BTreeSet<String>,
    pub map: Option<Arc<dyn MapFunction>>,
    pub merge: Option<MergeStrategy>,
}

impl TableConfig {
    /// Returns `true` if the table resolves conflicts with compare-and-set columns.
    pub fn is_cas(&self) -> bool {
        !self.cas.is_empty()
    }

    /// Returns every column named by the configuration, which must exist in the table.
    pub fn referenced_columns(&self) -> impl Iterator<Item = &str> {
        self.cas
            .iter()
            .chain(self.deadlines.keys())
            .chain(self.exprs.keys())
            .chain(self.extras.iter())
            .map(String::as_str)
    }
}

/// The configuration assembled from the user script.
///
/// Built once by [`crate::script::ScriptBuilder`] before any mutation is processed and shared
/// read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    options: SinkOptions,
    sources: HashMap<String, Arc<SourceConfig>>,
    tables: HashMap<TableName, Arc<TableConfig>>,
    default_table: Arc<TableConfig>,
}

impl Registry {
    pub(crate) fn new(
        options: SinkOptions,
        sources: HashMap<String, Arc<SourceConfig>>,
        tables: HashMap<TableName, Arc<TableConfig>>,
    ) -> Self {
        Self {
            options,
            sources,
            tables,
            default_table: Arc::new(TableConfig::default()),
        }
    }

    pub fn options(&self) -> &SinkOptions {
        &self.options
    }

    /// Returns the configuration of a source.
    ///
    /// An unconfigured source passes its documents through to the table of the same name.
    pub fn source(&self, name: &str) -> SinkResult<Arc<SourceConfig>> {
        if let Some(source) = self.sources.get(name) {
            return Ok(source.clone());
        }

        let table: TableName = name.parse()?;
        Ok(Arc::new(SourceConfig {
            name: name.to_string(),
            destination: SourceDestination::Target(table),
            recurse: false,
        }))
    }

    /// Returns the configuration of a table, or the empty configuration.
    pub fn table(&self, name: &TableName) -> Arc<TableConfig> {
        self.tables
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_table.clone())
    }

    /// Iterates over the explicitly configured tables.
    pub fn tables(&self) -> impl Iterator<Item = (&TableName, &Arc<TableConfig>)> {
        self.tables.iter()
    }

    pub fn sources(&self) -> impl Iterator<Item = &Arc<SourceConfig>> {
        self.sources.values()
    }
}
