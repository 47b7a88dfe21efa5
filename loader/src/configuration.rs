use config::load_config;
use config::shared::{LoaderConfig, PgConnectionConfig, ValidationError};

use crate::error::{LoaderError, LoaderResult};

/// Loads and validates the loader configuration from `./configuration`.
pub fn load_loader_config() -> LoaderResult<LoaderConfig> {
    let config = load_config::<LoaderConfig>().map_err(LoaderError::config)?;
    config.validate().map_err(LoaderError::config)?;

    Ok(config)
}

/// Returns the source connection, which only `discover` needs.
pub fn require_source(config: &LoaderConfig) -> LoaderResult<&PgConnectionConfig> {
    config.source.as_ref().ok_or_else(|| {
        LoaderError::config(ValidationError::InvalidFieldValue {
            field: "source".to_string(),
            constraint: "a source connection is required to discover the catalog".to_string(),
        })
    })
}
