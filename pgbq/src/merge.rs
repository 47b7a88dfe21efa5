//! Deduplication and upsert of a staging table into its target.
//!
//! A [`MergePlan`] describes one reconciliation: which columns to copy and which of them form
//! the key. Within the staging table the row with the greatest arrival sequence wins for each
//! key, so the last record received is the one that lands in the target. The merge itself is
//! the only statement that changes the target, which keeps an abandoned cycle invisible.

use tracing::{info, warn};

use crate::destination::{Destination, quote_identifier};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::loader::STAGING_SEQUENCE_COLUMN;
use crate::types::TargetColumn;

/// Alias of the window column used to pick the winning row of each key.
const ROW_NUMBER_COLUMN: &str = "_pgbq_row_number";

/// Everything needed to reconcile a staging table into its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    target_table: String,
    staging_table: String,
    columns: Vec<String>,
    primary_key: Vec<String>,
}

impl MergePlan {
    /// Builds a plan copying `columns` from `staging_table` into `target_table`.
    ///
    /// Fails with [`ErrorKind::ConfigError`] when `primary_key` is empty or names a column
    /// that is not part of `columns`.
    pub fn new(
        target_table: impl Into<String>,
        staging_table: impl Into<String>,
        columns: &[TargetColumn],
        primary_key: &[String],
    ) -> EtlResult<MergePlan> {
        let target_table = target_table.into();

        if primary_key.is_empty() {
            return Err(etl_error!(
                ErrorKind::ConfigError,
                "Merge requires a primary key",
                format!("table `{target_table}` has no primary key columns")
            ));
        }

        let columns: Vec<String> = columns
            .iter()
            .map(|column| column.name.clone())
            .filter(|name| name != STAGING_SEQUENCE_COLUMN)
            .collect();

        if let Some(missing) = primary_key.iter().find(|key| !columns.contains(key)) {
            return Err(etl_error!(
                ErrorKind::ConfigError,
                "Primary key column not found",
                format!("table `{target_table}` has no column `{missing}`")
            ));
        }

        Ok(MergePlan {
            target_table,
            staging_table: staging_table.into(),
            columns,
            primary_key: primary_key.to_vec(),
        })
    }

    pub fn target_table(&self) -> &str {
        &self.target_table
    }

    pub fn staging_table(&self) -> &str {
        &self.staging_table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn is_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|key| key == column)
    }

    /// Columns rewritten when a key already exists in the target.
    pub fn update_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .map(String::as_str)
            .filter(|column| !self.is_key(column))
    }

    /// Renders the `MERGE` statement, given the fully qualified and quoted table names.
    pub fn to_sql(&self, target: &str, staging: &str) -> EtlResult<String> {
        let columns = quote_all(self.columns.iter().map(String::as_str))?;
        let keys = quote_all(self.primary_key.iter().map(String::as_str))?;
        let updates = quote_all(self.update_columns())?;
        let sequence = quote_identifier(STAGING_SEQUENCE_COLUMN, "sequence column")?;
        let row_number = quote_identifier(ROW_NUMBER_COLUMN, "row number column")?;

        let column_list = columns.join(", ");
        let mut sql = format!(
            "merge {target} as t\n\
             using (\n  \
             select {column_list} from (\n    \
             select {column_list}, row_number() over (partition by {partition} order by {sequence} desc) as {row_number}\n    \
             from {staging}\n  \
             )\n  \
             where {row_number} = 1\n\
             ) as s\n\
             on {on}\n",
            partition = keys.join(", "),
            on = keys
                .iter()
                .map(|key| format!("t.{key} is not distinct from s.{key}"))
                .collect::<Vec<_>>()
                .join(" and "),
        );

        if !updates.is_empty() {
            let assignments = updates
                .iter()
                .map(|column| format!("{column} = s.{column}"))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!("when matched then update set {assignments}\n"));
        }

        let values = columns
            .iter()
            .map(|column| format!("s.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(
            "when not matched then insert ({column_list}) values ({values})"
        ));

        Ok(sql)
    }
}

fn quote_all<'a>(names: impl Iterator<Item = &'a str>) -> EtlResult<Vec<String>> {
    names
        .map(|name| quote_identifier(name, "merge column"))
        .collect()
}

/// Applies staging tables to their targets and discards them afterwards.
#[derive(Debug, Clone)]
pub struct MergeReconciler<D> {
    destination: D,
}

impl<D> MergeReconciler<D>
where
    D: Destination,
{
    pub fn new(destination: D) -> MergeReconciler<D> {
        Self { destination }
    }

    /// Merges the staging table of `plan` into its target, then drops the staging table.
    ///
    /// A failed merge is reported as [`ErrorKind::MergeExecutionFailed`] and the staging table
    /// is kept for inspection and retry. Failing to drop the staging table after a successful
    /// merge only logs a warning since the table expires on its own.
    pub async fn reconcile(&self, plan: &MergePlan) -> EtlResult<()> {
        info!(
            target_table = plan.target_table(),
            staging_table = plan.staging_table(),
            "merging staging table into target"
        );

        if let Err(err) = self.destination.execute_merge(plan).await {
            return Err(etl_error!(
                ErrorKind::MergeExecutionFailed,
                "Merge into target table failed",
                format!(
                    "merging `{}` into `{}` failed, staging table kept: {}",
                    plan.staging_table(),
                    plan.target_table(),
                    err.detail().unwrap_or(err.description())
                ),
                source: err
            ));
        }

        if let Err(err) = self.destination.drop_table(plan.staging_table()).await {
            warn!(
                staging_table = plan.staging_table(),
                error = %err,
                "could not drop staging table after merge"
            );
        }

        Ok(())
    }
}
