use config::shared::PgConnectionConfig;
use postgres::introspection::{connect_to_source_database, fetch_column_descriptors};
use sqlx::PgPool;

use crate::catalog::SchemaIntrospector;
use crate::error::EtlResult;
use crate::types::{ColumnDescriptor, TableName};

/// Reads column metadata from a live Postgres database.
#[derive(Debug, Clone)]
pub struct PgSchemaIntrospector {
    pool: PgPool,
}

impl PgSchemaIntrospector {
    pub fn new(pool: PgPool) -> PgSchemaIntrospector {
        Self { pool }
    }

    /// Opens a single-connection pool to the source database.
    pub async fn connect(config: &PgConnectionConfig) -> EtlResult<PgSchemaIntrospector> {
        let pool = connect_to_source_database(config, 1).await?;

        Ok(Self { pool })
    }

    /// Closes the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl SchemaIntrospector for PgSchemaIntrospector {
    async fn column_descriptors(&self, table_name: &TableName) -> EtlResult<Vec<ColumnDescriptor>> {
        Ok(fetch_column_descriptors(&self.pool, table_name).await?)
    }
}
