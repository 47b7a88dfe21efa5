use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::coercion::parse_timestamp;
use crate::destination::{Destination, RejectedRow};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::loader::STAGING_SEQUENCE_COLUMN;
use crate::merge::MergePlan;
use crate::types::{Cell, Record, TargetColumn, TargetType, format_timestamp};

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<TargetColumn>,
    rows: Vec<Record>,
    expiration: Option<Duration>,
}

/// One call to [`Destination::append_rows`], as seen by the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendCall {
    pub table: String,
    pub rows: usize,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, MemoryTable>,
    appends: Vec<AppendCall>,
    merges: Vec<String>,
}

/// In-memory warehouse for tests and local runs.
///
/// Tables keep their declared columns and appended rows are checked against them the way the
/// warehouse checks streaming inserts: unknown fields and values of the wrong type are
/// refused per row. Merges follow the same semantics as the generated `MERGE` statement.
/// Everything is lost when the process exits.
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    /// Creates an empty destination.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Returns whether `table` exists.
    pub async fn has_table(&self, table: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.tables.contains_key(table)
    }

    /// Returns the names of all tables, sorted.
    pub async fn table_names(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.tables.keys().cloned().collect()
    }

    /// Returns a copy of the rows of `table`.
    pub async fn table_rows(&self, table: &str) -> Option<Vec<Record>> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).map(|table| table.rows.clone())
    }

    /// Returns the declared columns of `table`.
    pub async fn table_columns(&self, table: &str) -> Option<Vec<TargetColumn>> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).map(|table| table.columns.clone())
    }

    /// Returns the expiration `table` was created with or last set to.
    pub async fn table_expiration(&self, table: &str) -> Option<Duration> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).and_then(|table| table.expiration)
    }

    /// Returns every append call received so far, in order.
    pub async fn append_calls(&self) -> Vec<AppendCall> {
        let inner = self.inner.lock().await;
        inner.appends.clone()
    }

    /// Returns the target table of every merge executed so far, in order.
    pub async fn merged_tables(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.merges.clone()
    }

    /// Creates or replaces `table` with the given rows, bypassing validation.
    pub async fn seed_table(&self, table: &str, columns: Vec<TargetColumn>, rows: Vec<Record>) {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            table.to_string(),
            MemoryTable {
                columns,
                rows,
                expiration: None,
            },
        );
    }
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl Destination for MemoryDestination {
    fn name() -> &'static str {
        "memory"
    }

    async fn table_schema(&self, table: &str) -> EtlResult<Option<Vec<TargetColumn>>> {
        Ok(self.table_columns(table).await)
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[TargetColumn],
        expiration: Option<Duration>,
    ) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        if inner.tables.contains_key(table) {
            return Ok(());
        }

        info!(table, columns = columns.len(), "creating table in memory");

        inner.tables.insert(
            table.to_string(),
            MemoryTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
                expiration,
            },
        );

        Ok(())
    }

    async fn set_expiration(&self, table: &str, expiration: Duration) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(memory_table) = inner.tables.get_mut(table) else {
            return Err(etl_error!(
                ErrorKind::DestinationQueryFailed,
                "Table not found",
                format!("table `{table}` does not exist")
            ));
        };

        debug!(table, ?expiration, "setting table expiration in memory");
        memory_table.expiration = Some(expiration);

        Ok(())
    }

    async fn append_rows(&self, table: &str, rows: &[Record]) -> EtlResult<Vec<RejectedRow>> {
        let mut inner = self.inner.lock().await;

        inner.appends.push(AppendCall {
            table: table.to_string(),
            rows: rows.len(),
        });

        let Some(memory_table) = inner.tables.get_mut(table) else {
            return Err(etl_error!(
                ErrorKind::DestinationQueryFailed,
                "Table not found",
                format!("table `{table}` does not exist")
            ));
        };

        debug!(table, rows = rows.len(), "appending rows in memory");

        let mut rejected = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            match canonical_row(row, &memory_table.columns) {
                Ok(stored) => memory_table.rows.push(stored),
                Err(message) => rejected.push(RejectedRow::new(index, message)),
            }
        }

        Ok(rejected)
    }

    async fn max_sequence(&self, table: &str, column: &str) -> EtlResult<Option<i64>> {
        let inner = self.inner.lock().await;

        let Some(memory_table) = inner.tables.get(table) else {
            return Err(etl_error!(
                ErrorKind::DestinationQueryFailed,
                "Table not found",
                format!("table `{table}` does not exist")
            ));
        };

        Ok(memory_table
            .rows
            .iter()
            .filter_map(|row| match row.get(column) {
                Some(Cell::I64(value)) => Some(*value),
                _ => None,
            })
            .max())
    }

    async fn execute_merge(&self, plan: &MergePlan) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(staging) = inner.tables.get(plan.staging_table()) else {
            return Err(etl_error!(
                ErrorKind::DestinationQueryFailed,
                "Table not found",
                format!("staging table `{}` does not exist", plan.staging_table())
            ));
        };
        let winners = latest_rows_by_key(&staging.rows, plan);

        let Some(target) = inner.tables.get_mut(plan.target_table()) else {
            return Err(etl_error!(
                ErrorKind::DestinationQueryFailed,
                "Table not found",
                format!("target table `{}` does not exist", plan.target_table())
            ));
        };

        for winner in winners {
            let existing = target
                .rows
                .iter_mut()
                .find(|row| same_key(row, &winner, plan.primary_key()));

            match existing {
                Some(row) => {
                    for column in plan.update_columns() {
                        row.insert(column, cell_or_null(&winner, column));
                    }
                }
                None => {
                    let row = plan
                        .columns()
                        .iter()
                        .map(|column| (column.clone(), cell_or_null(&winner, column)))
                        .collect();
                    target.rows.push(row);
                }
            }
        }

        info!(
            target_table = plan.target_table(),
            rows = target.rows.len(),
            "merged staging table in memory"
        );

        inner.merges.push(plan.target_table().to_string());

        Ok(())
    }

    async fn drop_table(&self, table: &str) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        info!(table, "dropping table from memory");
        inner.tables.remove(table);

        Ok(())
    }
}

/// Picks, for every key, the staged row with the greatest arrival sequence. Later rows win
/// ties. Winners keep the order in which their key first appeared.
fn latest_rows_by_key(rows: &[Record], plan: &MergePlan) -> Vec<Record> {
    let mut winners: Vec<(i64, Record)> = Vec::new();

    for row in rows {
        let sequence = match row.get(STAGING_SEQUENCE_COLUMN) {
            Some(Cell::I64(sequence)) => *sequence,
            _ => i64::MIN,
        };

        match winners
            .iter_mut()
            .find(|(_, winner)| same_key(winner, row, plan.primary_key()))
        {
            Some(slot) if sequence >= slot.0 => *slot = (sequence, row.clone()),
            Some(_) => {}
            None => winners.push((sequence, row.clone())),
        }
    }

    winners.into_iter().map(|(_, row)| row).collect()
}

/// Null-safe key comparison, as `IS NOT DISTINCT FROM`.
fn same_key(left: &Record, right: &Record, keys: &[String]) -> bool {
    keys.iter()
        .all(|key| cell_or_null(left, key) == cell_or_null(right, key))
}

fn cell_or_null(row: &Record, column: &str) -> Cell {
    row.get(column).cloned().unwrap_or(Cell::Null)
}

/// Validates `row` against `columns` and returns it with every value in the column's
/// canonical form, as the warehouse stores it.
fn canonical_row(row: &Record, columns: &[TargetColumn]) -> Result<Record, String> {
    let mut canonical = Record::new();

    for (name, cell) in row.iter() {
        let Some(column) = columns.iter().find(|column| column.name == name) else {
            return Err(format!("no such field: {name}"));
        };

        if cell.is_null() {
            canonical.insert(name, Cell::Null);
            continue;
        }

        if column.is_repeated() {
            let Cell::Json(Value::Array(elements)) = cell else {
                return Err(format!("field {name} expects an array"));
            };

            let mut stored = Vec::with_capacity(elements.len());
            for element in elements {
                if element.is_null() {
                    return Err(format!("field {name} contains a null array element"));
                }
                let Some(element) = canonical_cell(column, &Cell::from(element.clone())) else {
                    return Err(format!("field {name} holds an invalid {}", column.target_type));
                };
                stored.push(element.to_json());
            }

            canonical.insert(name, Cell::Json(Value::Array(stored)));
            continue;
        }

        let Some(stored) = canonical_cell(column, cell) else {
            return Err(format!(
                "field {name} cannot hold `{}` as {}",
                cell.to_json(),
                column.target_type
            ));
        };
        canonical.insert(name, stored);
    }

    Ok(canonical)
}

/// Converts `cell` to the single representation `column` stores, [`None`] when the column
/// cannot hold it.
///
/// Integers sent as strings become integers and timestamps become RFC 3339 text in UTC, so
/// equal values compare equal whatever form they arrived in.
fn canonical_cell(column: &TargetColumn, cell: &Cell) -> Option<Cell> {
    match (column.target_type, cell) {
        (_, Cell::Null) => Some(Cell::Null),
        (TargetType::Int64, Cell::I64(value)) => Some(Cell::I64(*value)),
        (TargetType::Int64, Cell::String(text)) => text.trim().parse().ok().map(Cell::I64),
        (TargetType::Float64 | TargetType::Numeric, Cell::I64(value)) => {
            Some(Cell::F64(*value as f64))
        }
        (TargetType::Float64 | TargetType::Numeric, Cell::F64(value)) => Some(Cell::F64(*value)),
        (TargetType::Float64 | TargetType::Numeric, Cell::String(text)) => {
            text.trim().parse().ok().map(Cell::F64)
        }
        (TargetType::Bool, Cell::Bool(value)) => Some(Cell::Bool(*value)),
        (
            TargetType::String | TargetType::Bytes | TargetType::Date | TargetType::Time,
            Cell::String(text),
        ) => Some(Cell::String(text.clone())),
        (TargetType::Timestamp, Cell::Timestamp(value)) => {
            Some(Cell::String(format_timestamp(&value.and_utc())))
        }
        (TargetType::Timestamp, Cell::TimestampTz(value)) => {
            Some(Cell::String(format_timestamp(value)))
        }
        (TargetType::Timestamp, Cell::String(text)) => parse_timestamp(text)
            .map(|timestamp| Cell::String(format_timestamp(&timestamp))),
        (TargetType::Record, Cell::Json(value @ Value::Object(_))) => {
            Some(Cell::Json(value.clone()))
        }
        _ => None,
    }
}
