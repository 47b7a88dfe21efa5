use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use config::shared::{DestinationConfig, LoaderConfig, ValidationError};
use pgbq::catalog::{
    Catalog, KeyPolicy, PgSchemaIntrospector, configured_tables, discover_catalog,
};
use pgbq::destination::Destination;
use pgbq::destination::bigquery::BigQueryDestination;
use pgbq::destination::memory::MemoryDestination;
use pgbq::loader::StagingOptions;
use pgbq::pipeline::{CycleOutcome, LoadPipeline, LoadReport};
use pgbq::transport::ErrorRecordWriter;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{error, info};

use crate::configuration::require_source;
use crate::error::{LoaderError, LoaderResult};

/// Introspects the configured source tables and persists the resulting catalog.
///
/// Nothing is written unless every table could be described.
pub async fn discover(config: &LoaderConfig) -> LoaderResult<()> {
    let source = require_source(config)?;
    info!(
        host = %source.host,
        port = source.port,
        dbname = %source.name,
        "discovering source tables"
    );

    let introspector = PgSchemaIntrospector::connect(source).await?;
    let tables = configured_tables(&config.discovery);
    let key_policy = KeyPolicy::from_config(&config.discovery);

    let result = discover_catalog(&introspector, &tables, &key_policy).await;
    introspector.close().await;
    let catalog = result?;

    catalog.store(&config.catalog_path).await?;

    info!(
        streams = catalog.len(),
        path = %config.catalog_path.display(),
        "catalog stored"
    );

    Ok(())
}

/// Loads the records read from `input` (stdin when absent) into the configured destination.
///
/// Rejected rows are written to stdout as error records. Fails when any cycle failed.
pub async fn load(config: &LoaderConfig, input: Option<PathBuf>) -> LoaderResult<()> {
    let catalog = Catalog::load(&config.catalog_path).await?;
    let options = StagingOptions::from_config(&config.staging, &config.batch);

    info!(
        streams = catalog.len(),
        chunk_size = options.chunk_size,
        staging_prefix = %options.table_prefix,
        "starting load"
    );

    // Static dispatch per destination keeps the pipeline monomorphic.
    let report = match &config.destination {
        DestinationConfig::Memory => {
            let destination = MemoryDestination::new();
            run_pipeline(catalog, destination, options, input.as_deref()).await?
        }
        DestinationConfig::BigQuery {
            project_id,
            dataset_id,
            service_account_key,
            service_account_key_path,
        } => {
            let destination = match (service_account_key, service_account_key_path) {
                (Some(key), _) => {
                    BigQueryDestination::new_with_key(
                        project_id.clone(),
                        dataset_id.clone(),
                        key.expose_secret(),
                    )
                    .await?
                }
                (None, Some(path)) => {
                    BigQueryDestination::new_with_key_path(
                        project_id.clone(),
                        dataset_id.clone(),
                        path,
                    )
                    .await?
                }
                (None, None) => {
                    return Err(LoaderError::config(ValidationError::InvalidFieldValue {
                        field: "destination.big_query".to_string(),
                        constraint: "a service account key is required".to_string(),
                    }));
                }
            };
            run_pipeline(catalog, destination, options, input.as_deref()).await?
        }
    };

    for cycle in report.failed_cycles() {
        if let CycleOutcome::Failed(err) = &cycle.outcome {
            error!(stream = %cycle.stream, error = %err, "cycle failed");
        }
    }

    report.into_result()?;

    Ok(())
}

async fn run_pipeline<D>(
    catalog: Catalog,
    destination: D,
    options: StagingOptions,
    input: Option<&Path>,
) -> LoaderResult<LoadReport>
where
    D: Destination + Clone,
{
    let started_at = Utc::now();
    info!(
        destination = D::name(),
        started_at = %format_sync_time(started_at),
        "running load pipeline"
    );

    let sink = ErrorRecordWriter::new(tokio::io::stdout());
    let pipeline = LoadPipeline::new(catalog, destination, options, sink);

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let report = pipeline.load_from_reader(reader).await?;
    let finished_at = Utc::now();

    info!(
        destination = D::name(),
        started_at = %format_sync_time(started_at),
        finished_at = %format_sync_time(finished_at),
        cycles = report.cycles.len(),
        failed_cycles = report.failed_cycles().count(),
        rows_appended = report.rows_appended(),
        rows_rejected = report.rows_rejected(),
        elapsed_ms = elapsed_ms(started_at, finished_at),
        "load pipeline completed"
    );

    Ok(report)
}

fn format_sync_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds between the two instants, zero when the clock went backwards.
fn elapsed_ms(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> u64 {
    (finished_at - started_at).num_milliseconds().max(0) as u64
}
