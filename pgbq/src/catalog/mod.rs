//! The stream catalog: per stream, the source columns in declaration order and the primary
//! key.
//!
//! A catalog is produced once by [`discover_catalog`] and persisted as JSON. The loader reads
//! it back and never talks to the source database. The on-disk layout lists every column as
//! a metadata entry whose breadcrumb is `["properties", <column>]`:
//!
//! ```json
//! {"streams": [{"tap_stream_id": "users", "stream": "users", "schema": "public",
//!   "metadata": [{"breadcrumb": ["properties", "id"],
//!                 "metadata": {"type": "integer", "udt_name": "int4", "selected-by-default": true}}],
//!   "key_properties": ["id"]}]}
//! ```

mod discovery;
mod introspector;

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::types::{ColumnDescriptor, StreamSchema, TableName};

pub use discovery::{KeyPolicy, SchemaIntrospector, configured_tables, discover_catalog};
pub use introspector::PgSchemaIntrospector;

/// Source schema assumed for streams persisted without one.
const DEFAULT_SOURCE_SCHEMA: &str = "public";

/// Breadcrumb head of column metadata entries.
const PROPERTIES_BREADCRUMB: &str = "properties";

/// Streams known to the loader, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    streams: Vec<StreamSchema>,
}

impl Catalog {
    /// Builds a catalog, rejecting duplicate stream ids.
    pub fn new(streams: Vec<StreamSchema>) -> EtlResult<Catalog> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = streams
            .iter()
            .find(|stream| !seen.insert(stream.stream_id.as_str()))
        {
            return Err(etl_error!(
                ErrorKind::InvalidData,
                "Duplicate stream in catalog",
                format!("stream `{}` appears more than once", duplicate.stream_id)
            ));
        }

        Ok(Catalog { streams })
    }

    pub fn streams(&self) -> &[StreamSchema] {
        &self.streams
    }

    pub fn get(&self, stream_id: &str) -> Option<&StreamSchema> {
        self.streams
            .iter()
            .find(|stream| stream.stream_id == stream_id)
    }

    /// Like [`Catalog::get`], failing with [`ErrorKind::MissingStreamSchema`].
    pub fn require(&self, stream_id: &str) -> EtlResult<&StreamSchema> {
        self.get(stream_id).ok_or_else(|| {
            etl_error!(
                ErrorKind::MissingStreamSchema,
                "Stream not found in catalog",
                format!("stream `{stream_id}` was not discovered")
            )
        })
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Renders the persisted JSON form.
    pub fn to_json_string(&self) -> EtlResult<String> {
        let document = CatalogDocument {
            streams: self.streams.iter().map(StreamEntry::from).collect(),
        };

        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Parses the persisted JSON form.
    pub fn from_json_str(json: &str) -> EtlResult<Catalog> {
        let document: CatalogDocument = serde_json::from_str(json)?;

        let streams = document
            .streams
            .into_iter()
            .map(StreamSchema::try_from)
            .collect::<EtlResult<Vec<_>>>()?;

        Catalog::new(streams)
    }

    /// Reads a catalog written by [`Catalog::store`].
    pub async fn load(path: &Path) -> EtlResult<Catalog> {
        let json = tokio::fs::read_to_string(path).await.map_err(|err| {
            etl_error!(
                ErrorKind::IoError,
                "Catalog could not be read",
                format!("{}: {err}", path.display()),
                source: err
            )
        })?;

        let catalog = Catalog::from_json_str(&json)?;
        info!(path = %path.display(), streams = catalog.len(), "loaded catalog");

        Ok(catalog)
    }

    /// Writes the catalog to `path`, replacing any previous file only once fully written.
    pub async fn store(&self, path: &Path) -> EtlResult<()> {
        let json = self.to_json_string()?;

        let mut staged_path = path.as_os_str().to_owned();
        staged_path.push(".tmp");

        tokio::fs::write(&staged_path, json).await?;
        tokio::fs::rename(&staged_path, path).await?;

        info!(path = %path.display(), streams = self.len(), "stored catalog");

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogDocument {
    streams: Vec<StreamEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamEntry {
    tap_stream_id: String,
    stream: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    metadata: Vec<MetadataEntry>,
    #[serde(default)]
    key_properties: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataEntry {
    breadcrumb: Vec<String>,
    metadata: EntryMetadata,
}

/// Column entries are typed; stream-level entries written by other tools are kept opaque.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum EntryMetadata {
    Column(ColumnMetadata),
    Other(Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct ColumnMetadata {
    #[serde(rename = "type")]
    data_type: String,
    #[serde(default)]
    udt_name: Option<String>,
    #[serde(rename = "selected-by-default", default = "default_selected")]
    selected_by_default: bool,
}

fn default_selected() -> bool {
    true
}

impl From<&StreamSchema> for StreamEntry {
    fn from(schema: &StreamSchema) -> Self {
        let metadata = schema
            .columns
            .iter()
            .map(|column| MetadataEntry {
                breadcrumb: vec![PROPERTIES_BREADCRUMB.to_string(), column.name.clone()],
                metadata: EntryMetadata::Column(ColumnMetadata {
                    data_type: column.data_type.clone(),
                    udt_name: Some(column.udt_name.clone()),
                    selected_by_default: true,
                }),
            })
            .collect();

        StreamEntry {
            tap_stream_id: schema.stream_id.clone(),
            stream: schema.table_name.name.clone(),
            schema: Some(schema.table_name.schema.clone()),
            metadata,
            key_properties: schema.primary_key.clone(),
        }
    }
}

impl TryFrom<StreamEntry> for StreamSchema {
    type Error = crate::error::EtlError;

    fn try_from(entry: StreamEntry) -> EtlResult<StreamSchema> {
        let columns: Vec<ColumnDescriptor> = entry
            .metadata
            .into_iter()
            .filter_map(|item| match (item.breadcrumb.as_slice(), item.metadata) {
                ([head, name], EntryMetadata::Column(metadata)) if head == PROPERTIES_BREADCRUMB => {
                    Some(ColumnDescriptor::new(
                        name.clone(),
                        metadata.data_type,
                        metadata.udt_name.unwrap_or_default(),
                    ))
                }
                _ => None,
            })
            .collect();

        if let Some(key) = entry
            .key_properties
            .iter()
            .find(|key| !columns.iter().any(|column| &column.name == *key))
        {
            return Err(etl_error!(
                ErrorKind::InvalidData,
                "Catalog key property is not a column",
                format!("stream `{}` declares unknown key `{key}`", entry.tap_stream_id)
            ));
        }

        let schema = entry
            .schema
            .unwrap_or_else(|| DEFAULT_SOURCE_SCHEMA.to_string());

        Ok(StreamSchema::new(
            entry.tap_stream_id,
            TableName::new(schema, entry.stream),
            columns,
            entry.key_properties,
        ))
    }
}
