use gcp_bigquery_client::Client;
use gcp_bigquery_client::client_builder::ClientBuilder;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::query_parameter::QueryParameter;
use gcp_bigquery_client::model::query_parameter_type::QueryParameterType;
use gcp_bigquery_client::model::query_parameter_value::QueryParameterValue;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::{QueryResponse, ResultSet};
use gcp_bigquery_client::model::table_data_insert_all_request::TableDataInsertAllRequest;
use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::destination::bigquery::schema::{
    create_columns_spec, expiration_option, parse_column_type,
};
use crate::destination::{RejectedRow, sanitize_identifier};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::types::{Record, TargetColumn};

/// Server-side wait of each `getQueryResults` poll.
const QUERY_POLL_TIMEOUT_MS: i32 = 10_000;

/// BigQuery project identifier.
pub type BigQueryProjectId = String;
/// BigQuery dataset identifier.
pub type BigQueryDatasetId = String;

/// Thin wrapper over the BigQuery REST client scoped to one project.
pub struct BigQueryClient {
    project_id: BigQueryProjectId,
    client: Client,
}

impl BigQueryClient {
    /// Creates a client from a service account key file.
    pub async fn new_with_key_path(
        project_id: BigQueryProjectId,
        sa_key_file: &str,
    ) -> EtlResult<BigQueryClient> {
        let client = ClientBuilder::new()
            .build_from_service_account_key_file(sa_key_file)
            .await
            .map_err(bq_error_to_etl_error)?;

        Ok(BigQueryClient { project_id, client })
    }

    /// Creates a client from the JSON text of a service account key.
    pub async fn new_with_key(
        project_id: BigQueryProjectId,
        sa_key: &str,
    ) -> EtlResult<BigQueryClient> {
        let sa_key = parse_service_account_key(sa_key)
            .map_err(BQError::from)
            .map_err(bq_error_to_etl_error)?;
        let client = ClientBuilder::new()
            .build_from_service_account_key(sa_key, false)
            .await
            .map_err(bq_error_to_etl_error)?;

        Ok(BigQueryClient { project_id, client })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Returns `` `project`.`dataset`.`table` `` with every part sanitized.
    pub fn full_table_name(&self, dataset_id: &str, table_id: &str) -> EtlResult<String> {
        let project_id = sanitize_identifier(&self.project_id, "BigQuery project id")?;
        let dataset_id = sanitize_identifier(dataset_id, "BigQuery dataset id")?;
        let table_id = sanitize_identifier(table_id, "BigQuery table id")?;

        Ok(format!("`{project_id}`.`{dataset_id}`.`{table_id}`"))
    }

    /// Reads the columns of a table from `INFORMATION_SCHEMA.COLUMNS`, in ordinal order.
    pub async fn table_columns(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> EtlResult<Option<Vec<TargetColumn>>> {
        let project_id = sanitize_identifier(&self.project_id, "BigQuery project id")?;
        let dataset = sanitize_identifier(dataset_id, "BigQuery dataset id")?;

        let query = format!(
            "select column_name, data_type \
             from `{project_id}`.`{dataset}`.INFORMATION_SCHEMA.COLUMNS \
             where table_name = @table_name \
             order by ordinal_position"
        );

        let mut request = QueryRequest::new(query);
        request.query_parameters = Some(vec![string_parameter("table_name", table_id)]);

        let mut result_set = self.query(request).await?;

        let mut columns = Vec::new();
        while result_set.next_row() {
            let name = result_set
                .get_string_by_name("column_name")
                .map_err(bq_error_to_etl_error)?;
            let data_type = result_set
                .get_string_by_name("data_type")
                .map_err(bq_error_to_etl_error)?;

            if let (Some(name), Some(data_type)) = (name, data_type) {
                columns.push(parse_column_type(&name, &data_type));
            }
        }

        debug!(table_id, columns = columns.len(), "read table columns from bigquery");

        if columns.is_empty() {
            return Ok(None);
        }

        Ok(Some(columns))
    }

    /// Creates a table unless it exists, optionally with an expiration.
    pub async fn create_table_if_missing(
        &self,
        dataset_id: &str,
        table_id: &str,
        columns: &[TargetColumn],
        expiration: Option<Duration>,
    ) -> EtlResult<()> {
        let full_table_name = self.full_table_name(dataset_id, table_id)?;
        let columns_spec = create_columns_spec(columns)?;
        let options = expiration.map(expiration_option).unwrap_or_default();

        info!(%full_table_name, "creating table in bigquery");

        let query = format!("create table if not exists {full_table_name} {columns_spec} {options}");
        let _ = self.query(QueryRequest::new(query.trim_end().to_string())).await?;

        Ok(())
    }

    /// Moves the expiration of an existing table to `expiration` from now.
    pub async fn set_table_expiration(
        &self,
        dataset_id: &str,
        table_id: &str,
        expiration: Duration,
    ) -> EtlResult<()> {
        let full_table_name = self.full_table_name(dataset_id, table_id)?;
        let option = expiration_option(expiration);

        debug!(%full_table_name, "refreshing table expiration in bigquery");

        let query = format!("alter table {full_table_name} set {option}");
        let _ = self.query(QueryRequest::new(query)).await?;

        Ok(())
    }

    /// Drops a table if it exists.
    pub async fn drop_table(&self, dataset_id: &str, table_id: &str) -> EtlResult<()> {
        let full_table_name = self.full_table_name(dataset_id, table_id)?;

        info!(%full_table_name, "dropping table from bigquery");

        let query = format!("drop table if exists {full_table_name}");
        let _ = self.query(QueryRequest::new(query)).await?;

        Ok(())
    }

    /// Returns the maximum of an integer column, [`None`] for an empty table.
    pub async fn max_value(
        &self,
        dataset_id: &str,
        table_id: &str,
        column: &str,
    ) -> EtlResult<Option<i64>> {
        let full_table_name = self.full_table_name(dataset_id, table_id)?;
        let column = sanitize_identifier(column, "BigQuery column name")?;

        let query = format!("select max(`{column}`) as max_value from {full_table_name}");
        let mut result_set = self.query(QueryRequest::new(query)).await?;

        if !result_set.next_row() {
            return Ok(None);
        }

        result_set
            .get_i64_by_name("max_value")
            .map_err(bq_error_to_etl_error)
    }

    /// Streams rows into a table, skipping invalid rows and reporting them.
    pub async fn insert_rows(
        &self,
        dataset_id: &str,
        table_id: &str,
        rows: &[Record],
    ) -> EtlResult<Vec<RejectedRow>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = TableDataInsertAllRequest::new();
        request.skip_invalid_rows();
        for row in rows {
            request
                .add_row(None, row.to_json())
                .map_err(bq_error_to_etl_error)?;
        }

        let response = self
            .client
            .tabledata()
            .insert_all(&self.project_id, dataset_id, table_id, request)
            .await
            .map_err(bq_error_to_etl_error)?;

        let response = serde_json::to_value(&response)?;

        Ok(insert_errors(&response))
    }

    /// Executes a statement and returns its result set once the job has completed.
    ///
    /// `jobs.query` gives up waiting after its own timeout and reports an incomplete job, in
    /// which case the job is polled through `getQueryResults` until it finishes.
    pub async fn query(&self, request: QueryRequest) -> EtlResult<ResultSet> {
        let mut response = self
            .client
            .job()
            .query(&self.project_id, request)
            .await
            .map_err(bq_error_to_etl_error)?;

        let mut polls = 0u32;
        loop {
            match query_state(&response)? {
                QueryState::Complete => return Ok(ResultSet::new_from_query_response(response)),
                QueryState::Running { job_id, location } => {
                    polls += 1;
                    debug!(%job_id, polls, "bigquery job still running, polling results");

                    let parameters = GetQueryResultsParameters {
                        location,
                        timeout_ms: Some(QUERY_POLL_TIMEOUT_MS),
                        ..Default::default()
                    };
                    response = self
                        .client
                        .job()
                        .get_query_results(&self.project_id, &job_id, parameters)
                        .await
                        .map_err(bq_error_to_etl_error)?
                        .into();
                }
            }
        }
    }
}

impl fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryClient")
            .field("project_id", &self.project_id)
            .finish()
    }
}

fn string_parameter(name: &str, value: &str) -> QueryParameter {
    QueryParameter {
        name: Some(name.to_string()),
        parameter_type: Some(QueryParameterType {
            r#type: "STRING".to_string(),
            array_type: None,
            struct_types: None,
        }),
        parameter_value: Some(QueryParameterValue {
            value: Some(value.to_string()),
            array_values: None,
            struct_values: None,
        }),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum QueryState {
    Complete,
    Running {
        job_id: String,
        location: Option<String>,
    },
}

/// Classifies a query response, failing on job errors.
///
/// An incomplete response must carry a job reference, otherwise the job cannot be awaited.
fn query_state(response: &QueryResponse) -> EtlResult<QueryState> {
    if let Some(errors) = response.errors.as_ref().filter(|errors| !errors.is_empty()) {
        let messages: Vec<&str> = errors
            .iter()
            .map(|error| error.message.as_deref().unwrap_or("unknown error"))
            .collect();

        return Err(etl_error!(
            ErrorKind::DestinationQueryFailed,
            "BigQuery job failed",
            messages.join("; ")
        ));
    }

    if response.job_complete == Some(true) {
        return Ok(QueryState::Complete);
    }

    let job_reference = response.job_reference.as_ref();
    let Some(job_id) = job_reference.and_then(|reference| reference.job_id.clone()) else {
        return Err(etl_error!(
            ErrorKind::InvalidState,
            "BigQuery job incomplete",
            "the response carries no job reference to poll"
        ));
    };

    Ok(QueryState::Running {
        job_id,
        location: job_reference.and_then(|reference| reference.location.clone()),
    })
}

/// Extracts per-row errors from a serialized `tabledata.insertAll` response.
///
/// A row with several errors is reported once with the messages joined.
fn insert_errors(response: &Value) -> Vec<RejectedRow> {
    let Some(entries) = response.get("insertErrors").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let index = entry.get("index").and_then(Value::as_u64)?;
            let messages: Vec<&str> = entry
                .get("errors")
                .and_then(Value::as_array)
                .map(|errors| {
                    errors
                        .iter()
                        .filter_map(|error| error.get("message").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();

            let message = if messages.is_empty() {
                "row rejected by BigQuery".to_string()
            } else {
                messages.join("; ")
            };

            Some(RejectedRow::new(index as usize, message))
        })
        .collect()
}

/// Converts BigQuery client errors into [`EtlError`] with an appropriate kind.
pub(crate) fn bq_error_to_etl_error(err: BQError) -> EtlError {
    let (kind, description) = match &err {
        BQError::InvalidServiceAccountKey(_) => (
            ErrorKind::AuthenticationError,
            "Invalid BigQuery service account key",
        ),
        BQError::InvalidServiceAccountAuthenticator(_) => (
            ErrorKind::AuthenticationError,
            "Invalid BigQuery service account authenticator",
        ),
        BQError::AuthError(_) => (
            ErrorKind::AuthenticationError,
            "BigQuery authentication error",
        ),
        BQError::YupAuthError(_) => (
            ErrorKind::AuthenticationError,
            "BigQuery OAuth authentication error",
        ),
        BQError::NoToken => (
            ErrorKind::AuthenticationError,
            "BigQuery authentication token missing",
        ),
        BQError::RequestError(_) => (ErrorKind::DestinationIoError, "BigQuery request failed"),
        BQError::ResponseError { .. } => {
            (ErrorKind::DestinationQueryFailed, "BigQuery response error")
        }
        BQError::NoDataAvailable => (
            ErrorKind::InvalidState,
            "BigQuery result set positioning error",
        ),
        BQError::InvalidColumnIndex { .. } => {
            (ErrorKind::InvalidData, "BigQuery invalid column index")
        }
        BQError::InvalidColumnName { .. } => {
            (ErrorKind::InvalidData, "BigQuery invalid column name")
        }
        BQError::InvalidColumnType { .. } => {
            (ErrorKind::ConversionError, "BigQuery column type mismatch")
        }
        BQError::SerializationError(_) => (
            ErrorKind::SerializationError,
            "BigQuery JSON serialization error",
        ),
        _ => (ErrorKind::DestinationQueryFailed, "BigQuery operation failed"),
    };

    etl_error!(kind, description, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_errors_are_indexed_and_joined() {
        let response = json!({
            "kind": "bigquery#tableDataInsertAllResponse",
            "insertErrors": [
                {"index": 2, "errors": [
                    {"reason": "invalid", "message": "no such field: nickname"},
                    {"reason": "invalid", "message": "bad int"}
                ]},
                {"index": 5, "errors": []}
            ]
        });

        assert_eq!(
            insert_errors(&response),
            vec![
                RejectedRow::new(2, "no such field: nickname; bad int"),
                RejectedRow::new(5, "row rejected by BigQuery"),
            ]
        );
        assert!(insert_errors(&json!({"kind": "x"})).is_empty());
    }

    #[test]
    fn test_incomplete_job_is_polled_by_reference() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": false,
            "jobReference": {"projectId": "proj", "jobId": "job_123", "location": "EU"}
        }))
        .unwrap();

        assert_eq!(
            query_state(&response).unwrap(),
            QueryState::Running {
                job_id: "job_123".to_string(),
                location: Some("EU".to_string()),
            }
        );

        let completed = QueryResponse {
            job_complete: Some(true),
            ..response
        };
        assert_eq!(query_state(&completed).unwrap(), QueryState::Complete);
    }

    #[test]
    fn test_incomplete_job_without_reference_is_an_error() {
        let response = QueryResponse {
            job_complete: Some(false),
            ..Default::default()
        };

        let err = query_state(&response).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_job_errors_fail_the_query() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "errors": [
                {"reason": "invalidQuery", "message": "UPDATE/MERGE must match at most one source row"}
            ]
        }))
        .unwrap();

        let err = query_state(&response).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationQueryFailed);
        assert_eq!(
            err.detail(),
            Some("UPDATE/MERGE must match at most one source row")
        );
    }

    #[test]
    fn test_string_parameter_shape() {
        let parameter = string_parameter("table_name", "users");
        assert_eq!(parameter.name.as_deref(), Some("table_name"));
        assert_eq!(
            parameter.parameter_value.and_then(|value| value.value),
            Some("users".to_string())
        );
    }
}
