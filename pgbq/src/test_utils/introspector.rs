use std::collections::{HashMap, HashSet};

use crate::catalog::SchemaIntrospector;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::types::{ColumnDescriptor, TableName};

/// Introspector answering from a fixed set of tables.
///
/// Unknown tables report no columns, like a missing table in `information_schema`.
#[derive(Debug, Clone, Default)]
pub struct StaticIntrospector {
    tables: HashMap<TableName, Vec<ColumnDescriptor>>,
    failing: HashSet<TableName>,
}

impl StaticIntrospector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table_name: TableName, columns: Vec<ColumnDescriptor>) -> Self {
        self.tables.insert(table_name, columns);
        self
    }

    /// Makes introspection of `table_name` fail as a query error.
    pub fn failing_on(mut self, table_name: TableName) -> Self {
        self.failing.insert(table_name);
        self
    }
}

impl SchemaIntrospector for StaticIntrospector {
    async fn column_descriptors(&self, table_name: &TableName) -> EtlResult<Vec<ColumnDescriptor>> {
        if self.failing.contains(table_name) {
            return Err(etl_error!(
                ErrorKind::SourceQueryFailed,
                "Injected introspection failure",
                format!("table {table_name}")
            ));
        }

        Ok(self.tables.get(table_name).cloned().unwrap_or_default())
    }
}
