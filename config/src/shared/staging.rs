use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Naming and lifetime of per-table staging tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StagingConfig {
    /// Prefix prepended to the target table name to build the staging table name.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    /// Minutes after creation at which an abandoned staging table is dropped by the warehouse.
    #[serde(default = "default_expiration_mins")]
    pub expiration_mins: u32,
}

impl StagingConfig {
    pub const DEFAULT_TABLE_PREFIX: &'static str = "temp_table_";

    pub const DEFAULT_EXPIRATION_MINS: u32 = 60;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.table_prefix.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "staging.table_prefix".to_string(),
                constraint: "must not be empty, staging would overwrite the target".to_string(),
            });
        }

        if self.expiration_mins == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "staging.expiration_mins".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            table_prefix: default_table_prefix(),
            expiration_mins: default_expiration_mins(),
        }
    }
}

fn default_table_prefix() -> String {
    StagingConfig::DEFAULT_TABLE_PREFIX.to_string()
}

fn default_expiration_mins() -> u32 {
    StagingConfig::DEFAULT_EXPIRATION_MINS
}
