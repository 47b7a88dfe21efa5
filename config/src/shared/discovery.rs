use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Which source tables become streams and how their merge keys are chosen.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DiscoveryConfig {
    /// Source tables to expose as streams, in catalog order.
    pub tables: Vec<String>,
    /// Source schema per table. Tables without an entry live in [`DiscoveryConfig::DEFAULT_SCHEMA`].
    #[serde(default)]
    pub schemas: HashMap<String, String>,
    /// Column names treated as primary key for every table without an override.
    #[serde(default = "default_primary_key_fields")]
    pub primary_key_fields: Vec<String>,
    /// Per-table primary key columns, taking precedence over `primary_key_fields`.
    #[serde(default)]
    pub primary_keys: HashMap<String, Vec<String>>,
}

impl DiscoveryConfig {
    pub const DEFAULT_SCHEMA: &'static str = "public";

    /// Returns the source schema of `table`.
    pub fn schema_for(&self, table: &str) -> &str {
        self.schemas
            .get(table)
            .map(String::as_str)
            .unwrap_or(Self::DEFAULT_SCHEMA)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tables.is_empty() {
            return Err(ValidationError::NoTablesConfigured);
        }

        if let Some(table) = self.tables.iter().find(|table| table.trim().is_empty()) {
            return Err(ValidationError::InvalidFieldValue {
                field: "discovery.tables".to_string(),
                constraint: format!("table names must not be blank, got `{table}`"),
            });
        }

        Ok(())
    }
}

fn default_primary_key_fields() -> Vec<String> {
    vec!["id".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let config: DiscoveryConfig = serde_json::from_str(
            r#"{"tables":["users","events"],
                "schemas":{"events":"analytics"},
                "primary_keys":{"events":["event_id","tenant_id"]}}"#,
        )
        .unwrap();

        assert_eq!(config.schema_for("users"), "public");
        assert_eq!(config.schema_for("events"), "analytics");
        assert_eq!(config.primary_key_fields, ["id".to_string()]);
        assert_eq!(
            config.primary_keys["events"],
            ["event_id".to_string(), "tenant_id".to_string()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_table_list_is_rejected() {
        let config: DiscoveryConfig = serde_json::from_str(r#"{"tables":[]}"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::NoTablesConfigured)
        ));
    }
}
