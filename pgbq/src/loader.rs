//! Provisioning of target and staging tables and chunked appends into them.
//!
//! A [`LoadCycle`] is created per stream visit by [`StagingLoader::ensure_tables`]. It fixes
//! the resolved column list, the table receiving appends and the next arrival sequence.
//! Streams with a primary key append into a staging table that is later merged; insert-only
//! streams append straight into the target.

use std::time::Duration;

use config::shared::{BatchConfig, StagingConfig};
use tracing::{debug, info};

use crate::coercion::coerce_record;
use crate::destination::Destination;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::merge::MergePlan;
use crate::types::{Record, StreamSchema, TargetColumn, TargetType};

/// Staging-only column holding the arrival order of each row within a stream.
pub const STAGING_SEQUENCE_COLUMN: &str = "_pgbq_sequence";

/// Knobs of the staging loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingOptions {
    pub table_prefix: String,
    /// Lifetime of staging tables, after which the warehouse drops them.
    pub expiration: Duration,
    /// Maximum number of rows sent per append.
    pub chunk_size: usize,
}

impl StagingOptions {
    pub fn from_config(staging: &StagingConfig, batch: &BatchConfig) -> StagingOptions {
        Self {
            table_prefix: staging.table_prefix.clone(),
            expiration: Duration::from_secs(u64::from(staging.expiration_mins) * 60),
            chunk_size: batch.max_size,
        }
    }

    /// Name of the staging table paired with `table`.
    pub fn staging_table_name(&self, table: &str) -> String {
        format!("{}{table}", self.table_prefix)
    }
}

impl Default for StagingOptions {
    fn default() -> Self {
        Self::from_config(&StagingConfig::default(), &BatchConfig::default())
    }
}

/// A row that did not make it into the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRejection {
    pub stream: String,
    pub message: String,
}

impl RowRejection {
    pub fn new(stream: impl Into<String>, message: impl Into<String>) -> RowRejection {
        Self {
            stream: stream.into(),
            message: message.into(),
        }
    }

    fn from_error(stream: &str, err: &EtlError) -> RowRejection {
        let message = match err.detail() {
            Some(detail) => format!("{}: {detail}", err.description()),
            None => err.description().to_string(),
        };

        Self::new(stream, message)
    }
}

/// Result of [`StagingLoader::append_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub appended: usize,
    pub rejections: Vec<RowRejection>,
}

/// State of one stream visit between provisioning and merge.
#[derive(Debug, Clone)]
pub struct LoadCycle {
    stream_id: String,
    target_table: String,
    staging_table: Option<String>,
    columns: Vec<TargetColumn>,
    merge_plan: Option<MergePlan>,
    next_sequence: i64,
}

impl LoadCycle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn target_table(&self) -> &str {
        &self.target_table
    }

    pub fn staging_table(&self) -> Option<&str> {
        self.staging_table.as_deref()
    }

    /// Columns rows are projected onto before they are appended.
    pub fn columns(&self) -> &[TargetColumn] {
        &self.columns
    }

    /// Plan reconciling the staging table, [`None`] for insert-only streams.
    pub fn merge_plan(&self) -> Option<&MergePlan> {
        self.merge_plan.as_ref()
    }

    pub fn is_insert_only(&self) -> bool {
        self.staging_table.is_none()
    }

    pub fn next_sequence(&self) -> i64 {
        self.next_sequence
    }

    fn append_table(&self) -> &str {
        self.staging_table.as_deref().unwrap_or(&self.target_table)
    }
}

/// Creates tables lazily and appends coerced rows into them.
#[derive(Debug, Clone)]
pub struct StagingLoader<D> {
    destination: D,
    options: StagingOptions,
}

impl<D> StagingLoader<D>
where
    D: Destination,
{
    pub fn new(destination: D, options: StagingOptions) -> StagingLoader<D> {
        Self {
            destination,
            options,
        }
    }

    pub fn options(&self) -> &StagingOptions {
        &self.options
    }

    /// Makes sure the target, and the staging table when the stream has a key, exist.
    ///
    /// An existing target keeps its live columns. A staging table left behind by an earlier
    /// cycle is reused, its numbering continued and its expiration restarted. Destination failures are reported as
    /// [`ErrorKind::TargetProvisionFailed`].
    pub async fn ensure_tables(&self, schema: &StreamSchema) -> EtlResult<LoadCycle> {
        let target_table = schema.target_table().to_string();
        let catalog_columns = schema.target_columns();

        let live_columns = self
            .destination
            .table_schema(&target_table)
            .await
            .map_err(|err| provision_error(&target_table, err))?;

        let columns = match live_columns {
            Some(live_columns) => {
                debug!(table = %target_table, "target table exists, using its schema");
                resolve_schema(live_columns, &catalog_columns)
            }
            None => {
                info!(table = %target_table, "creating target table from catalog");
                self.destination
                    .create_table(&target_table, &catalog_columns, None)
                    .await
                    .map_err(|err| provision_error(&target_table, err))?;
                catalog_columns
            }
        };

        if schema.is_insert_only() {
            info!(table = %target_table, "stream has no primary key, appending to target");

            return Ok(LoadCycle {
                stream_id: schema.stream_id.clone(),
                target_table,
                staging_table: None,
                columns,
                merge_plan: None,
                next_sequence: 0,
            });
        }

        let staging_table = self.options.staging_table_name(&target_table);
        let merge_plan = MergePlan::new(
            target_table.clone(),
            staging_table.clone(),
            &columns,
            &schema.primary_key,
        )?;

        let existing_staging = self
            .destination
            .table_schema(&staging_table)
            .await
            .map_err(|err| provision_error(&staging_table, err))?;

        let next_sequence = match existing_staging {
            Some(_) => {
                let max_sequence = self
                    .destination
                    .max_sequence(&staging_table, STAGING_SEQUENCE_COLUMN)
                    .await
                    .map_err(|err| provision_error(&staging_table, err))?;

                self.destination
                    .set_expiration(&staging_table, self.options.expiration)
                    .await
                    .map_err(|err| provision_error(&staging_table, err))?;

                info!(
                    table = %staging_table,
                    ?max_sequence,
                    "reusing staging table left by an earlier cycle"
                );

                max_sequence.map_or(0, |sequence| sequence + 1)
            }
            None => {
                let mut staging_columns = columns.clone();
                staging_columns.push(TargetColumn::scalar(
                    STAGING_SEQUENCE_COLUMN,
                    TargetType::Int64,
                ));

                info!(table = %staging_table, "creating staging table");
                self.destination
                    .create_table(
                        &staging_table,
                        &staging_columns,
                        Some(self.options.expiration),
                    )
                    .await
                    .map_err(|err| provision_error(&staging_table, err))?;

                0
            }
        };

        Ok(LoadCycle {
            stream_id: schema.stream_id.clone(),
            target_table,
            staging_table: Some(staging_table),
            columns,
            merge_plan: Some(merge_plan),
            next_sequence,
        })
    }

    /// Coerces `records` and appends them in chunks, preserving arrival order.
    ///
    /// Fields unknown to the cycle's columns are dropped. Rows refused by coercion or by the
    /// destination become [`RowRejection`]s; only a failure of the append call itself is
    /// returned as an error.
    pub async fn append_batch(
        &self,
        cycle: &mut LoadCycle,
        records: Vec<Record>,
    ) -> EtlResult<AppendOutcome> {
        let mut outcome = AppendOutcome::default();
        let chunk_size = self.options.chunk_size.max(1);
        let mut records = records.into_iter();

        loop {
            let chunk: Vec<Record> = records.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }

            self.append_chunk(cycle, chunk, &mut outcome).await?;
        }

        Ok(outcome)
    }

    async fn append_chunk(
        &self,
        cycle: &mut LoadCycle,
        chunk: Vec<Record>,
        outcome: &mut AppendOutcome,
    ) -> EtlResult<()> {
        let mut rows = Vec::with_capacity(chunk.len());

        for mut record in chunk {
            let dropped =
                record.retain_columns(|name| cycle.columns.iter().any(|c| c.name == name));
            if !dropped.is_empty() {
                debug!(stream = %cycle.stream_id, ?dropped, "dropping fields unknown to the table");
            }

            if let Err(err) = coerce_record(&mut record, &cycle.columns) {
                outcome
                    .rejections
                    .push(RowRejection::from_error(&cycle.stream_id, &err));
                continue;
            }

            if cycle.staging_table.is_some() {
                record.insert(STAGING_SEQUENCE_COLUMN, cycle.next_sequence);
                cycle.next_sequence += 1;
            }

            rows.push(record);
        }

        if rows.is_empty() {
            return Ok(());
        }

        let rejected = self
            .destination
            .append_rows(cycle.append_table(), &rows)
            .await?;

        debug!(
            table = cycle.append_table(),
            rows = rows.len(),
            rejected = rejected.len(),
            "appended chunk"
        );

        outcome.appended += rows.len().saturating_sub(rejected.len());
        outcome.rejections.extend(
            rejected
                .into_iter()
                .map(|row| RowRejection::new(&cycle.stream_id, row.message)),
        );

        Ok(())
    }
}

/// Live columns of an existing target, with serialization flags taken from the catalog.
pub fn resolve_schema(
    live_columns: Vec<TargetColumn>,
    catalog_columns: &[TargetColumn],
) -> Vec<TargetColumn> {
    live_columns
        .into_iter()
        .map(|mut column| {
            if catalog_columns
                .iter()
                .any(|catalog| catalog.name == column.name && catalog.needs_serialization)
            {
                column.needs_serialization = true;
            }
            column
        })
        .collect()
}

fn provision_error(table: &str, err: EtlError) -> EtlError {
    etl_error!(
        ErrorKind::TargetProvisionFailed,
        "Table provisioning failed",
        format!(
            "table `{table}`: {}",
            err.detail().unwrap_or(err.description())
        ),
        source: err
    )
}
