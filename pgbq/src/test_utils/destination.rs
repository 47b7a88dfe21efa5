use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::destination::{Destination, RejectedRow};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::merge::MergePlan;
use crate::types::{Record, TargetColumn};

/// Destination operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    TableSchema,
    CreateTable,
    SetExpiration,
    AppendRows,
    MaxSequence,
    /// Matched against the target table of the plan.
    ExecuteMerge,
    DropTable,
}

/// Wraps a destination and fails selected operations on selected tables.
#[derive(Debug, Clone)]
pub struct FaultyDestination<D> {
    wrapped: D,
    faults: Arc<RwLock<HashSet<(Operation, String)>>>,
}

impl<D> FaultyDestination<D>
where
    D: Destination,
{
    pub fn wrap(wrapped: D) -> Self {
        Self {
            wrapped,
            faults: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Makes `operation` fail for `table` from now on.
    pub async fn fail_on(&self, operation: Operation, table: &str) {
        let mut faults = self.faults.write().await;
        faults.insert((operation, table.to_string()));
    }

    /// Clears every configured fault.
    pub async fn heal(&self) {
        let mut faults = self.faults.write().await;
        faults.clear();
    }

    pub fn wrapped(&self) -> &D {
        &self.wrapped
    }

    async fn check(&self, operation: Operation, table: &str) -> EtlResult<()> {
        let faults = self.faults.read().await;
        if faults.contains(&(operation, table.to_string())) {
            return Err(etl_error!(
                ErrorKind::DestinationQueryFailed,
                "Injected destination failure",
                format!("{operation:?} on `{table}`")
            ));
        }

        Ok(())
    }
}

impl<D> Destination for FaultyDestination<D>
where
    D: Destination + Send + Sync,
{
    fn name() -> &'static str {
        "faulty"
    }

    async fn table_schema(&self, table: &str) -> EtlResult<Option<Vec<TargetColumn>>> {
        self.check(Operation::TableSchema, table).await?;
        self.wrapped.table_schema(table).await
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[TargetColumn],
        expiration: Option<Duration>,
    ) -> EtlResult<()> {
        self.check(Operation::CreateTable, table).await?;
        self.wrapped.create_table(table, columns, expiration).await
    }

    async fn set_expiration(&self, table: &str, expiration: Duration) -> EtlResult<()> {
        self.check(Operation::SetExpiration, table).await?;
        self.wrapped.set_expiration(table, expiration).await
    }

    async fn append_rows(&self, table: &str, rows: &[Record]) -> EtlResult<Vec<RejectedRow>> {
        self.check(Operation::AppendRows, table).await?;
        self.wrapped.append_rows(table, rows).await
    }

    async fn max_sequence(&self, table: &str, column: &str) -> EtlResult<Option<i64>> {
        self.check(Operation::MaxSequence, table).await?;
        self.wrapped.max_sequence(table, column).await
    }

    async fn execute_merge(&self, plan: &MergePlan) -> EtlResult<()> {
        self.check(Operation::ExecuteMerge, plan.target_table()).await?;
        self.wrapped.execute_merge(plan).await
    }

    async fn drop_table(&self, table: &str) -> EtlResult<()> {
        self.check(Operation::DropTable, table).await?;
        self.wrapped.drop_table(table).await
    }
}
