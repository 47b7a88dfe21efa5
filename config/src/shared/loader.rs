use std::path::PathBuf;

use serde::Deserialize;

use crate::Config;
use crate::shared::{
    BatchConfig, DestinationConfig, DiscoveryConfig, PgConnectionConfig, StagingConfig,
    ValidationError,
};

/// Root configuration of the `pgbq-loader` binary.
///
/// Deliberately not [`serde::Serialize`] because it holds secrets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoaderConfig {
    /// Source database, required by `discover` only.
    #[serde(default)]
    pub source: Option<PgConnectionConfig>,
    pub discovery: DiscoveryConfig,
    /// Location of the persisted catalog.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub staging: StagingConfig,
}

impl LoaderConfig {
    pub const DEFAULT_CATALOG_PATH: &'static str = "catalog.json";

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(source) = &self.source {
            source.validate()?;
        }
        self.discovery.validate()?;
        self.destination.validate()?;
        self.batch.validate()?;
        self.staging.validate()?;

        Ok(())
    }
}

impl Config for LoaderConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] =
        &["discovery.tables", "discovery.primary_key_fields"];
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from(LoaderConfig::DEFAULT_CATALOG_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_applies_defaults() {
        let config: LoaderConfig = serde_json::from_str(
            r#"{"discovery":{"tables":["users"]},"destination":"memory"}"#,
        )
        .unwrap();

        assert!(config.source.is_none());
        assert_eq!(config.catalog_path, PathBuf::from("catalog.json"));
        assert_eq!(config.batch.max_size, BatchConfig::DEFAULT_MAX_SIZE);
        assert_eq!(config.staging.table_prefix, "temp_table_");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_covers_nested_sections() {
        let config: LoaderConfig = serde_json::from_str(
            r#"{"discovery":{"tables":["users"]},"destination":"memory","batch":{"max_size":0}}"#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }
}
