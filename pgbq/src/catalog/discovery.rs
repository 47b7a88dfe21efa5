use std::collections::HashMap;
use std::future::Future;

use config::shared::DiscoveryConfig;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::types::{ColumnDescriptor, StreamSchema, TableName};

/// Source of column metadata for discovery.
pub trait SchemaIntrospector {
    /// Returns the columns of `table_name` in declaration order.
    fn column_descriptors(
        &self,
        table_name: &TableName,
    ) -> impl Future<Output = EtlResult<Vec<ColumnDescriptor>>> + Send;
}

/// Primary key candidates: a default list plus per-table overrides.
///
/// Candidates that are not columns of a table are ignored, so a table without any of them is
/// loaded in insert-only mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    default_fields: Vec<String>,
    overrides: HashMap<String, Vec<String>>,
}

impl KeyPolicy {
    pub fn new(default_fields: Vec<String>) -> KeyPolicy {
        Self {
            default_fields,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, table: impl Into<String>, fields: Vec<String>) -> KeyPolicy {
        self.overrides.insert(table.into(), fields);
        self
    }

    pub fn from_config(config: &DiscoveryConfig) -> KeyPolicy {
        Self {
            default_fields: config.primary_key_fields.clone(),
            overrides: config.primary_keys.clone(),
        }
    }

    /// Returns the candidates of `table`.
    pub fn fields_for(&self, table: &str) -> &[String] {
        self.overrides
            .get(table)
            .unwrap_or(&self.default_fields)
    }
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::new(vec!["id".to_string()])
    }
}

/// Introspects every table of `tables` and assembles the catalog.
///
/// Tables are visited in order and the catalog keeps that order. The primary key of a stream
/// is every column whose name is a candidate of `key_policy`, in column order. Any failure,
/// including a table without visible columns, aborts the whole pass with
/// [`ErrorKind::SchemaIntrospectionFailed`].
pub async fn discover_catalog<I>(
    introspector: &I,
    tables: &[TableName],
    key_policy: &KeyPolicy,
) -> EtlResult<Catalog>
where
    I: SchemaIntrospector,
{
    let mut streams = Vec::with_capacity(tables.len());

    for table_name in tables {
        let columns = introspector
            .column_descriptors(table_name)
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::SchemaIntrospectionFailed,
                    "Schema introspection failed",
                    format!(
                        "table {table_name}: {}",
                        err.detail().unwrap_or(err.description())
                    ),
                    source: err
                )
            })?;

        if columns.is_empty() {
            return Err(etl_error!(
                ErrorKind::SchemaIntrospectionFailed,
                "Schema introspection failed",
                format!("table {table_name} does not exist or has no visible columns")
            ));
        }

        let candidates = key_policy.fields_for(&table_name.name);
        let primary_key: Vec<String> = columns
            .iter()
            .filter(|column| candidates.contains(&column.name))
            .map(|column| column.name.clone())
            .collect();

        if primary_key.is_empty() {
            warn!(%table_name, ?candidates, "no primary key column found, stream is insert-only");
        }

        info!(
            %table_name,
            columns = columns.len(),
            ?primary_key,
            "discovered stream"
        );

        streams.push(StreamSchema::new(
            table_name.name.clone(),
            table_name.clone(),
            columns,
            primary_key,
        ));
    }

    Catalog::new(streams)
}

/// Qualified names of the tables configured for discovery, in configuration order.
pub fn configured_tables(config: &DiscoveryConfig) -> Vec<TableName> {
    config
        .tables
        .iter()
        .map(|table| TableName::new(config.schema_for(table), table.as_str()))
        .collect()
}
