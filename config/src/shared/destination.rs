use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Warehouse the loader writes to.
///
/// Deliberately not [`serde::Serialize`] so the service account key never ends up in a
/// serialized form.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationConfig {
    /// In-process destination, useful for dry runs and tests.
    Memory,
    BigQuery {
        /// Google Cloud project identifier.
        project_id: String,
        /// Dataset holding both target and staging tables.
        dataset_id: String,
        /// Service account key JSON.
        #[serde(default)]
        service_account_key: Option<SecretString>,
        /// Path of a service account key JSON file, used when no inline key is given.
        #[serde(default)]
        service_account_key_path: Option<String>,
    },
}

impl DestinationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            DestinationConfig::Memory => Ok(()),
            DestinationConfig::BigQuery {
                project_id,
                dataset_id,
                service_account_key,
                service_account_key_path,
            } => {
                if project_id.is_empty() || dataset_id.is_empty() {
                    return Err(ValidationError::InvalidFieldValue {
                        field: "destination.big_query".to_string(),
                        constraint: "`project_id` and `dataset_id` must not be empty".to_string(),
                    });
                }

                if service_account_key.is_some() == service_account_key_path.is_some() {
                    return Err(ValidationError::InvalidFieldValue {
                        field: "destination.big_query".to_string(),
                        constraint: "exactly one of `service_account_key` and \
                                     `service_account_key_path` must be set"
                            .to_string(),
                    });
                }

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_destination_deserializes_from_unit_variant() {
        let config: DestinationConfig = serde_json::from_str(r#""memory""#).unwrap();
        assert!(matches!(config, DestinationConfig::Memory));
    }

    #[test]
    fn test_bigquery_requires_exactly_one_key_source() {
        let config: DestinationConfig = serde_json::from_str(
            r#"{"big_query":{"project_id":"proj","dataset_id":"raw"}}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        let config: DestinationConfig = serde_json::from_str(
            r#"{"big_query":{"project_id":"proj","dataset_id":"raw","service_account_key":"{}"}}"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }
}
