use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use config::shared::SinkOptions;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorKind, SinkError, SinkResult};
use crate::merge::{MergeStrategy, StandardMerge};
use crate::script::registry::{Registry, SourceConfig, SourceDestination, TableConfig};
use crate::script::{DispatchFunction, MapFunction, MergeFunction};
use crate::types::TableName;
use crate::{bail, sink_error};

/// Properties accepted by [`ScriptBuilder::configure_source`].
///
/// Exactly one of `dispatch` or `target` must be set. `deletes_to` is only meaningful
/// alongside `dispatch`.
#[derive(Debug, Clone, Default)]
pub struct SourceProps {
    pub dispatch: Option<Arc<dyn DispatchFunction>>,
    pub deletes_to: Option<String>,
    pub target: Option<String>,
    pub recurse: bool,
}

impl SourceProps {
    pub fn target(table: impl Into<String>) -> Self {
        Self {
            target: Some(table.into()),
            ..Self::default()
        }
    }

    pub fn dispatch(dispatch: impl DispatchFunction + 'static) -> Self {
        Self {
            dispatch: Some(Arc::new(dispatch)),
            ..Self::default()
        }
    }

    pub fn deletes_to(mut self, table: impl Into<String>) -> Self {
        self.deletes_to = Some(table.into());
        self
    }

    pub fn recurse(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }
}

/// Properties accepted by [`ScriptBuilder::configure_table`]. Every property is optional.
///
/// Deadlines are duration strings such as `"5m"` or `"2h30m"`.
#[derive(Debug, Clone, Default)]
pub struct TableProps {
    pub cas: Vec<String>,
    pub deadlines: BTreeMap<String, String>,
    pub exprs: BTreeMap<String, String>,
    pub extras: Option<String>,
    pub ignore: BTreeMap<String, bool>,
    pub map: Option<Arc<dyn MapFunction>>,
    pub merge: Option<MergeStrategy>,
}

impl TableProps {
    pub fn cas<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cas = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn deadline(mut self, column: impl Into<String>, max_age: impl Into<String>) -> Self {
        self.deadlines.insert(column.into(), max_age.into());
        self
    }

    pub fn expr(mut self, column: impl Into<String>, expr: impl Into<String>) -> Self {
        self.exprs.insert(column.into(), expr.into());
        self
    }

    pub fn extras(mut self, column: impl Into<String>) -> Self {
        self.extras = Some(column.into());
        self
    }

    pub fn ignore(mut self, column: impl Into<String>) -> Self {
        self.ignore.insert(column.into(), true);
        self
    }

    pub fn map(mut self, map: impl MapFunction + 'static) -> Self {
        self.map = Some(Arc::new(map));
        self
    }

    pub fn merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = Some(merge);
        self
    }

    pub fn merge_with(self, merge: impl MergeFunction + 'static) -> Self {
        self.merge(MergeStrategy::Custom(Arc::new(merge)))
    }
}

/// Returns the built-in three-way merge strategy, optionally delegating unresolved
/// conflicts to `fallback`.
pub fn standard_merge(fallback: Option<Arc<dyn MergeFunction>>) -> MergeStrategy {
    MergeStrategy::Standard(StandardMerge::new(fallback))
}

/// Returns a fresh random UUID string.
pub fn random_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Assembles a [`Registry`] from the calls made by a user script.
///
/// Registration happens once, before traffic flows. Every problem is reported when it is
/// registered, so a script fails at startup rather than on its first mutation.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    options: SinkOptions,
    sources: HashMap<String, Arc<SourceConfig>>,
    tables: HashMap<TableName, Arc<TableConfig>>,
}

impl ScriptBuilder {
    pub fn new(options: SinkOptions) -> Self {
        Self {
            options,
            sources: HashMap::new(),
            tables: HashMap::new(),
        }
    }

    /// Registers the routing of a source.
    pub fn configure_source(&mut self, name: &str, props: SourceProps) -> SinkResult<()> {
        if name.is_empty() {
            bail!(ErrorKind::ConfigError, "Source name must not be empty");
        }
        if self.sources.contains_key(name) {
            bail!(
                ErrorKind::DuplicateRegistration,
                "Source is already configured",
                name
            );
        }

        let destination = match (props.dispatch, props.target) {
            (Some(dispatch), None) => {
                let deletes_to = props
                    .deletes_to
                    .as_deref()
                    .map(str::parse::<TableName>)
                    .transpose()?;

                SourceDestination::Dispatch {
                    dispatch,
                    deletes_to,
                }
            }
            (None, Some(target)) => {
                if props.deletes_to.is_some() {
                    bail!(
                        ErrorKind::ConfigError,
                        "deletesTo requires a dispatch function",
                        name
                    );
                }

                SourceDestination::Target(target.parse()?)
            }
            (Some(_), Some(_)) => bail!(
                ErrorKind::ConfigError,
                "Source must set either dispatch or target, not both",
                name
            ),
            (None, None) => bail!(
                ErrorKind::ConfigError,
                "Source must set either dispatch or target",
                name
            ),
        };

        debug!(source = name, recurse = props.recurse, "configured source");

        self.sources.insert(
            name.to_string(),
            Arc::new(SourceConfig {
                name: name.to_string(),
                destination,
                recurse: props.recurse,
            }),
        );

        Ok(())
    }

    /// Registers the behavior of a table.
    ///
    /// Every invalid property is reported, aggregated into one error.
    pub fn configure_table(&mut self, name: &str, props: TableProps) -> SinkResult<()> {
        let table: TableName = name.parse()?;
        if self.tables.contains_key(&table) {
            bail!(
                ErrorKind::DuplicateRegistration,
                "Table is already configured",
                table
            );
        }

        let mut errors = Vec::new();

        let mut cas = Vec::with_capacity(props.cas.len());
        for column in props.cas {
            if column.is_empty() {
                errors.push(sink_error!(
                    ErrorKind::ConfigError,
                    "CAS column name must not be empty",
                    table
                ));
            } else if cas.contains(&column) {
                errors.push(sink_error!(
                    ErrorKind::ConfigError,
                    "CAS column is listed more than once",
                    format!("{table}.{column}")
                ));
            } else {
                cas.push(column);
            }
        }

        let mut deadlines = BTreeMap::new();
        for (column, raw) in props.deadlines {
            match humantime::parse_duration(raw.trim()) {
                Ok(duration) => {
                    deadlines.insert(column, duration);
                }
                Err(err) => errors.push(
                    SinkError::from((
                        ErrorKind::InvalidDuration,
                        "Invalid deadline duration",
                        format!("{table}.{column}: `{raw}`: {err}"),
                    ))
                    .with_source(err),
                ),
            }
        }

        if props.merge.is_some() && cas.is_empty() {
            errors.push(sink_error!(
                ErrorKind::ConfigError,
                "A merge function requires CAS columns",
                table
            ));
        }

        if let Some(extras) = props.extras.as_deref()
            && extras.is_empty()
        {
            errors.push(sink_error!(
                ErrorKind::ConfigError,
                "Extras column name must not be empty",
                table
            ));
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        let ignore: BTreeSet<String> = props
            .ignore
            .into_iter()
            .filter_map(|(column, ignored)| ignored.then_some(column))
            .collect();

        debug!(table = %table, cas = ?cas, "configured table");

        self.tables.insert(
            table,
            Arc::new(TableConfig {
                cas,
                deadlines,
                exprs: props.exprs,
                extras: props.extras,
                ignore,
                map: props.map,
                merge: props.merge,
            }),
        );

        Ok(())
    }

    /// Overrides runtime options by flag name.
    ///
    /// Every option is attempted; failures are aggregated into one error.
    pub fn set_options<I, K, V>(&mut self, options: I) -> SinkResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let errors: Vec<SinkError> = options
            .into_iter()
            .filter_map(|(key, value)| self.options.set(key.as_ref(), value.as_ref()).err())
            .map(SinkError::from)
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    pub fn options(&self) -> &SinkOptions {
        &self.options
    }

    /// Freezes the configuration.
    pub fn build(self) -> Registry {
        Registry::new(self.options, self.sources, self.tables)
    }
}
