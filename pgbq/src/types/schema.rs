use crate::mapping::map_column;
use crate::types::{ColumnDescriptor, TableName, TargetColumn};

/// Everything the loader knows about one stream.
///
/// Captured by discovery and persisted in the catalog. `primary_key` is ordered like
/// `columns`; an empty key puts the stream in insert-only mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSchema {
    pub stream_id: String,
    pub table_name: TableName,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
}

impl StreamSchema {
    pub fn new(
        stream_id: impl Into<String>,
        table_name: TableName,
        columns: Vec<ColumnDescriptor>,
        primary_key: Vec<String>,
    ) -> StreamSchema {
        Self {
            stream_id: stream_id.into(),
            table_name,
            columns,
            primary_key,
        }
    }

    /// Name of the warehouse table receiving this stream.
    pub fn target_table(&self) -> &str {
        &self.stream_id
    }

    /// Maps every source column to its warehouse column, in declaration order.
    pub fn target_columns(&self) -> Vec<TargetColumn> {
        self.columns.iter().map(map_column).collect()
    }

    pub fn is_insert_only(&self) -> bool {
        self.primary_key.is_empty()
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|key| key == column)
    }
}
