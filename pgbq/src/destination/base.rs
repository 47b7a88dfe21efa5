use std::future::Future;
use std::time::Duration;

use crate::error::EtlResult;
use crate::merge::MergePlan;
use crate::types::{Record, TargetColumn};

/// A row the destination refused during an append, identified by its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub index: usize,
    pub message: String,
}

impl RejectedRow {
    pub fn new(index: usize, message: impl Into<String>) -> RejectedRow {
        Self {
            index,
            message: message.into(),
        }
    }
}

/// Warehouse operations needed to stage and reconcile streams.
///
/// Table names are unqualified; implementations resolve them inside their own dataset.
/// Appends report refused rows instead of failing the whole batch so that the caller can
/// decide how to surface them.
pub trait Destination {
    /// Returns the name of the destination.
    fn name() -> &'static str;

    /// Reads the live column list of `table`, or [`None`] when the table does not exist.
    fn table_schema(
        &self,
        table: &str,
    ) -> impl Future<Output = EtlResult<Option<Vec<TargetColumn>>>> + Send;

    /// Creates `table` unless it already exists.
    ///
    /// With an `expiration`, the warehouse removes the table on its own once the duration has
    /// elapsed.
    fn create_table(
        &self,
        table: &str,
        columns: &[TargetColumn],
        expiration: Option<Duration>,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Restarts the expiration of `table` so it now expires `expiration` from the call.
    fn set_expiration(
        &self,
        table: &str,
        expiration: Duration,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Appends `rows` to `table` and returns the rows that were refused.
    fn append_rows(
        &self,
        table: &str,
        rows: &[Record],
    ) -> impl Future<Output = EtlResult<Vec<RejectedRow>>> + Send;

    /// Returns the largest value of the integer column `column` in `table`, [`None`] when
    /// the table is empty.
    fn max_sequence(
        &self,
        table: &str,
        column: &str,
    ) -> impl Future<Output = EtlResult<Option<i64>>> + Send;

    /// Applies a staging table to its target as a single statement.
    fn execute_merge(&self, plan: &MergePlan) -> impl Future<Output = EtlResult<()>> + Send;

    /// Drops `table` if it exists.
    fn drop_table(&self, table: &str) -> impl Future<Output = EtlResult<()>> + Send;
}
