use std::collections::VecDeque;

use serde_json::Value;
use tracing::debug;

use crate::error::{ErrorKind, SinkResult};
use crate::script::{FunctionInvoker, FunctionKind, SourceConfig, SourceDestination};
use crate::types::{Document, DocumentValue, Hlc, Mutation, TableName};
use crate::{bail, sink_error};

/// A mutation bound for a destination table.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMutation {
    pub table: TableName,
    pub mutation: Mutation,
}

/// Routes the mutations of one source to destination tables.
#[derive(Debug)]
pub struct Router<'a> {
    source: &'a SourceConfig,
    invoker: &'a FunctionInvoker,
    max_depth: usize,
}

impl<'a> Router<'a> {
    pub fn new(source: &'a SourceConfig, invoker: &'a FunctionInvoker, max_depth: usize) -> Self {
        Self {
            source,
            invoker,
            max_depth,
        }
    }

    /// Resolves the destination tables of a mutation.
    ///
    /// Deletes are routed to a single table and never dispatched. Upserts from a recursing
    /// source first have their nested documents detached, and each nested document is routed
    /// on its own, parents before children.
    pub async fn route(&self, mutation: Mutation) -> SinkResult<Vec<RoutedMutation>> {
        if mutation.is_delete() {
            let table = self.delete_target()?;
            return Ok(vec![RoutedMutation { table, mutation }]);
        }

        let mut pending = VecDeque::from([(mutation, 0usize)]);
        let mut routed = Vec::new();

        while let Some((mut mutation, depth)) = pending.pop_front() {
            if self.source.recurse {
                let children = detach_children(&mut mutation);
                if !children.is_empty() && depth + 1 > self.max_depth {
                    bail!(
                        ErrorKind::RecursionLimitExceeded,
                        "Nested documents exceed the recursion limit",
                        format!(
                            "source `{}` nests deeper than {} levels",
                            self.source.name, self.max_depth
                        )
                    );
                }
                pending.extend(children.into_iter().map(|child| (child, depth + 1)));
            }

            routed.extend(self.route_one(mutation).await?);
        }

        Ok(routed)
    }

    async fn route_one(&self, mutation: Mutation) -> SinkResult<Vec<RoutedMutation>> {
        let dispatch = match &self.source.destination {
            SourceDestination::Target(table) => {
                return Ok(vec![RoutedMutation {
                    table: table.clone(),
                    mutation,
                }]);
            }
            SourceDestination::Dispatch { dispatch, .. } => dispatch.clone(),
        };

        let Some(data) = mutation.data.clone() else {
            return Ok(Vec::new());
        };
        let meta = mutation.meta.clone();
        let value = self
            .invoker
            .invoke(FunctionKind::Dispatch, move || dispatch.dispatch(&data, &meta))
            .await?;

        let tables = match value {
            Value::Null => {
                debug!(source = %self.source.name, "dispatch discarded the document");
                return Ok(Vec::new());
            }
            Value::Object(tables) => tables,
            other => bail!(
                ErrorKind::InvalidDocument,
                "Dispatch must return an object or null",
                format!("found {}", DocumentValue::from(other).type_name())
            ),
        };

        let mut routed = Vec::new();
        for (name, documents) in tables {
            let table: TableName = name.parse().map_err(|err| {
                sink_error!(
                    ErrorKind::InvalidDocument,
                    "Dispatch returned an invalid table name",
                    format!("`{name}`"),
                    source: err
                )
            })?;

            let documents = match documents {
                Value::Null => continue,
                Value::Array(documents) => documents,
                other => bail!(
                    ErrorKind::InvalidDocument,
                    "Dispatch must map tables to arrays of documents",
                    format!("{table}: found {}", DocumentValue::from(other).type_name())
                ),
            };

            for document in documents {
                let data = Document::try_from(document)?;
                routed.push(RoutedMutation {
                    table: table.clone(),
                    mutation: Mutation {
                        before: None,
                        data: Some(data),
                        key: mutation.key.clone(),
                        time: mutation.time,
                        meta: mutation.meta.clone(),
                    },
                });
            }
        }

        Ok(routed)
    }

    /// Returns the table receiving the source's deletes.
    fn delete_target(&self) -> SinkResult<TableName> {
        match &self.source.destination {
            SourceDestination::Target(table) => Ok(table.clone()),
            SourceDestination::Dispatch {
                deletes_to: Some(table),
                ..
            } => Ok(table.clone()),
            SourceDestination::Dispatch {
                deletes_to: None, ..
            } => self.source.name.parse().map_err(|_| {
                sink_error!(
                    ErrorKind::MissingDeleteTarget,
                    "Source has no table to apply deletes to",
                    format!(
                        "source `{}` sets no deletesTo and is not a table name",
                        self.source.name
                    )
                )
            }),
        }
    }
}

/// Removes nested documents from a mutation and returns them as mutations of their own.
///
/// A property holding a document, or a non-empty array made only of documents, is detached.
/// Children inherit the parent's time and metadata; their key is the parent key extended with
/// the property name and, for arrays, the element index.
fn detach_children(mutation: &mut Mutation) -> Vec<Mutation> {
    let Some(data) = mutation.data.as_mut() else {
        return Vec::new();
    };

    let nested: Vec<String> = data
        .iter()
        .filter(|(_, value)| is_nested(value))
        .map(|(name, _)| name.clone())
        .collect();

    let mut children = Vec::new();
    for name in nested {
        let mut key = mutation.key.clone();
        key.push(DocumentValue::from(name.as_str()));

        match data.remove(&name) {
            Some(DocumentValue::Document(child)) => {
                children.push(child_mutation(mutation.time, &mutation.meta, key, child));
            }
            Some(DocumentValue::Array(elements)) => {
                for (index, element) in elements.into_iter().enumerate() {
                    if let DocumentValue::Document(child) = element {
                        let mut key = key.clone();
                        key.push(DocumentValue::from(index as i64));
                        children.push(child_mutation(
                            mutation.time,
                            &mutation.meta,
                            key,
                            child,
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    children
}

fn is_nested(value: &DocumentValue) -> bool {
    match value {
        DocumentValue::Document(_) => true,
        DocumentValue::Array(elements) => {
            !elements.is_empty()
                && elements
                    .iter()
                    .all(|element| matches!(element, DocumentValue::Document(_)))
        }
        _ => false,
    }
}

fn child_mutation(time: Hlc, meta: &Document, key: Vec<DocumentValue>, data: Document) -> Mutation {
    Mutation {
        before: None,
        data: Some(data),
        key,
        time,
        meta: meta.clone(),
    }
}
