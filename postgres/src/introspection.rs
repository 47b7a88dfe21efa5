use config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::debug;

use crate::schema::{ColumnDescriptor, TableName};

/// Connects to the source database with a small pool.
///
/// Discovery runs one query per table sequentially, so a single connection is enough.
pub async fn connect_to_source_database(
    config: &PgConnectionConfig,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    let options = config.with_db();

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Returns the columns of `table_name` in declaration order.
///
/// An empty result means the table does not exist or is not visible to the connected role.
pub async fn fetch_column_descriptors(
    pool: &PgPool,
    table_name: &TableName,
) -> Result<Vec<ColumnDescriptor>, sqlx::Error> {
    let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
        r#"
        select column_name::text, data_type::text, udt_name::text
        from information_schema.columns
        where table_schema = $1 and table_name = $2
        order by ordinal_position
        "#,
    )
    .bind(&table_name.schema)
    .bind(&table_name.name)
    .fetch_all(pool)
    .await?;

    debug!(%table_name, columns = rows.len(), "fetched column descriptors");

    Ok(rows
        .into_iter()
        .map(|(name, data_type, udt_name)| ColumnDescriptor {
            name,
            data_type,
            udt_name: udt_name.unwrap_or_default(),
        })
        .collect())
}
