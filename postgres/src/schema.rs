use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully qualified Postgres table name.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    /// Schema containing the table.
    pub schema: String,
    /// Name of the table within the schema.
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Column metadata as reported by `information_schema.columns`.
///
/// `data_type` is the declared SQL type (`character varying`, `ARRAY`, `USER-DEFINED`, ...)
/// and `udt_name` the underlying type tag, which names the element type of arrays
/// (`_int4`, `_text`).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
}

impl ColumnDescriptor {
    pub fn new(
        name: impl Into<String>,
        data_type: impl Into<String>,
        udt_name: impl Into<String>,
    ) -> ColumnDescriptor {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            udt_name: udt_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_display() {
        let table_name = TableName::new("analytics", "page_views");
        assert_eq!(table_name.to_string(), "analytics.page_views");
    }

    #[test]
    fn test_column_descriptor_serde_shape() {
        let column = ColumnDescriptor::new("tags", "ARRAY", "_text");
        let json = serde_json::to_value(&column).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"name": "tags", "data_type": "ARRAY", "udt_name": "_text"})
        );
    }
}
