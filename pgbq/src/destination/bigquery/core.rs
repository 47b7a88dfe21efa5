use std::sync::Arc;
use std::time::Duration;

use gcp_bigquery_client::model::query_request::QueryRequest;
use tracing::info;

use crate::destination::bigquery::client::BigQueryClient;
use crate::destination::{Destination, RejectedRow};
use crate::error::EtlResult;
use crate::merge::MergePlan;
use crate::types::{Record, TargetColumn};

/// Destination writing into one BigQuery dataset.
///
/// Tables are created with DDL statements, rows are streamed with `tabledata.insertAll` and
/// reconciliation runs the plan's `MERGE` statement as a query job.
#[derive(Debug, Clone)]
pub struct BigQueryDestination {
    client: Arc<BigQueryClient>,
    dataset_id: String,
}

impl BigQueryDestination {
    pub fn new(client: BigQueryClient, dataset_id: impl Into<String>) -> BigQueryDestination {
        Self {
            client: Arc::new(client),
            dataset_id: dataset_id.into(),
        }
    }

    /// Authenticates with the JSON text of a service account key.
    pub async fn new_with_key(
        project_id: String,
        dataset_id: String,
        sa_key: &str,
    ) -> EtlResult<BigQueryDestination> {
        let client = BigQueryClient::new_with_key(project_id, sa_key).await?;

        Ok(Self::new(client, dataset_id))
    }

    /// Authenticates with a service account key file.
    pub async fn new_with_key_path(
        project_id: String,
        dataset_id: String,
        sa_key_file: &str,
    ) -> EtlResult<BigQueryDestination> {
        let client = BigQueryClient::new_with_key_path(project_id, sa_key_file).await?;

        Ok(Self::new(client, dataset_id))
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }
}

impl Destination for BigQueryDestination {
    fn name() -> &'static str {
        "bigquery"
    }

    async fn table_schema(&self, table: &str) -> EtlResult<Option<Vec<TargetColumn>>> {
        self.client.table_columns(&self.dataset_id, table).await
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[TargetColumn],
        expiration: Option<Duration>,
    ) -> EtlResult<()> {
        self.client
            .create_table_if_missing(&self.dataset_id, table, columns, expiration)
            .await
    }

    async fn set_expiration(&self, table: &str, expiration: Duration) -> EtlResult<()> {
        self.client
            .set_table_expiration(&self.dataset_id, table, expiration)
            .await
    }

    async fn append_rows(&self, table: &str, rows: &[Record]) -> EtlResult<Vec<RejectedRow>> {
        self.client.insert_rows(&self.dataset_id, table, rows).await
    }

    async fn max_sequence(&self, table: &str, column: &str) -> EtlResult<Option<i64>> {
        self.client.max_value(&self.dataset_id, table, column).await
    }

    async fn execute_merge(&self, plan: &MergePlan) -> EtlResult<()> {
        let target = self
            .client
            .full_table_name(&self.dataset_id, plan.target_table())?;
        let staging = self
            .client
            .full_table_name(&self.dataset_id, plan.staging_table())?;
        let query = plan.to_sql(&target, &staging)?;

        info!(%target, %staging, "executing merge in bigquery");

        let _ = self
            .client
            .query(QueryRequest::new(query))
            .await?;

        Ok(())
    }

    async fn drop_table(&self, table: &str) -> EtlResult<()> {
        self.client.drop_table(&self.dataset_id, table).await
    }
}
