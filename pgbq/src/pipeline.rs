//! Drives load cycles from a stream of transport messages.
//!
//! Consecutive `RECORD` messages of one stream form a load cycle. Records are buffered up to
//! the chunk size and appended as the buffer fills. When the stream changes, or the input
//! ends, the cycle is closed: keyed streams are merged from staging, insert-only streams are
//! already in place. A stream that comes back after another one starts a new cycle.
//!
//! Failures are contained per cycle. A cycle whose tables cannot be provisioned, whose
//! append fails or whose merge fails is reported as failed while the following cycles
//! proceed. Only malformed input and a broken rejection sink abort the whole load.

use std::time::Instant;

use serde_json::{Map, Value};
use tokio::io::AsyncBufRead;
use tracing::{debug, error, info};

use crate::catalog::Catalog;
use crate::destination::Destination;
use crate::error::{EtlError, EtlResult};
use crate::loader::{LoadCycle, StagingLoader, StagingOptions};
use crate::merge::MergeReconciler;
use crate::transport::{Message, MessageReader, RejectionSink};
use crate::types::Record;

/// How a load cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Staging was merged into the target and dropped.
    Merged,
    /// Rows were appended straight into the target of an insert-only stream.
    Appended,
    Failed(EtlError),
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Merged => "merged",
            CycleOutcome::Appended => "appended",
            CycleOutcome::Failed(_) => "failed",
        }
    }
}

/// Summary of one load cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub stream: String,
    pub records_received: usize,
    pub rows_appended: usize,
    pub rows_rejected: usize,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Failed(_))
    }
}

/// Summary of a whole load, one entry per cycle in the order cycles were closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub cycles: Vec<CycleReport>,
}

impl LoadReport {
    pub fn failed_cycles(&self) -> impl Iterator<Item = &CycleReport> {
        self.cycles.iter().filter(|cycle| cycle.is_failed())
    }

    pub fn has_failures(&self) -> bool {
        self.failed_cycles().next().is_some()
    }

    pub fn rows_appended(&self) -> usize {
        self.cycles.iter().map(|cycle| cycle.rows_appended).sum()
    }

    pub fn rows_rejected(&self) -> usize {
        self.cycles.iter().map(|cycle| cycle.rows_rejected).sum()
    }

    /// Aggregates the errors of failed cycles, [`Ok`] when every cycle succeeded.
    pub fn into_result(self) -> EtlResult<()> {
        let errors: Vec<EtlError> = self
            .cycles
            .into_iter()
            .filter_map(|cycle| match cycle.outcome {
                CycleOutcome::Failed(err) => Some(err),
                _ => None,
            })
            .collect();

        if errors.is_empty() {
            return Ok(());
        }

        Err(errors.into())
    }
}

#[derive(Debug)]
enum CycleState {
    Ready(LoadCycle),
    Failed(EtlError),
}

#[derive(Debug)]
struct ActiveCycle {
    stream: String,
    state: CycleState,
    buffer: Vec<Record>,
    records_received: usize,
    rows_appended: usize,
    rows_rejected: usize,
}

/// Loads transport messages into a destination, cycle by cycle.
#[derive(Debug)]
pub struct LoadPipeline<D, S> {
    catalog: Catalog,
    loader: StagingLoader<D>,
    reconciler: MergeReconciler<D>,
    sink: S,
    current: Option<ActiveCycle>,
    report: LoadReport,
}

impl<D, S> LoadPipeline<D, S>
where
    D: Destination + Clone,
    S: RejectionSink,
{
    pub fn new(catalog: Catalog, destination: D, options: StagingOptions, sink: S) -> Self {
        Self {
            catalog,
            loader: StagingLoader::new(destination.clone(), options),
            reconciler: MergeReconciler::new(destination),
            sink,
            current: None,
            report: LoadReport::default(),
        }
    }

    /// Reads every message of `reader`, then closes the last cycle.
    ///
    /// A malformed line aborts the load; the open cycle is abandoned without merging.
    pub async fn load_from_reader<R>(mut self, reader: R) -> EtlResult<LoadReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let started_at = Instant::now();
        let mut reader = MessageReader::new(reader);

        while let Some(message) = reader.next_message().await? {
            self.handle_message(message).await?;
        }

        let report = self.finish().await?;

        info!(
            cycles = report.cycles.len(),
            rows_appended = report.rows_appended(),
            rows_rejected = report.rows_rejected(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "load finished"
        );

        Ok(report)
    }

    /// Processes one message.
    ///
    /// Only failures of the rejection sink are returned; cycle failures end up in the report.
    pub async fn handle_message(&mut self, message: Message) -> EtlResult<()> {
        match message {
            Message::Record { stream, record } => self.handle_record(stream, record).await,
            Message::Schema { stream, .. } => {
                debug!(%stream, "ignoring schema message, catalog is authoritative");
                Ok(())
            }
            Message::State { value } => {
                debug!(state = %value, "ignoring state message");
                Ok(())
            }
            Message::Other => {
                debug!("ignoring message of unknown type");
                Ok(())
            }
        }
    }

    /// Closes the open cycle and returns the report of the load.
    pub async fn finish(mut self) -> EtlResult<LoadReport> {
        self.close_cycle().await?;

        Ok(self.report)
    }

    async fn handle_record(&mut self, stream: String, record: Map<String, Value>) -> EtlResult<()> {
        let same_stream = self
            .current
            .as_ref()
            .is_some_and(|active| active.stream == stream);

        if !same_stream {
            self.close_cycle().await?;
            self.current = Some(self.open_cycle(stream).await);
        }

        let chunk_size = self.loader.options().chunk_size.max(1);
        let Some(active) = self.current.as_mut() else {
            return Ok(());
        };

        active.records_received += 1;
        if matches!(active.state, CycleState::Failed(_)) {
            return Ok(());
        }

        active.buffer.push(Record::from(record));
        if active.buffer.len() >= chunk_size {
            self.flush().await?;
        }

        Ok(())
    }

    async fn open_cycle(&self, stream: String) -> ActiveCycle {
        info!(%stream, "starting load cycle");

        let state = match self.catalog.require(&stream) {
            Ok(schema) => match self.loader.ensure_tables(schema).await {
                Ok(cycle) => CycleState::Ready(cycle),
                Err(err) => {
                    error!(%stream, error = %err, "could not provision tables, skipping stream records");
                    CycleState::Failed(err)
                }
            },
            Err(err) => {
                error!(%stream, "stream is not in the catalog, skipping its records");
                CycleState::Failed(err)
            }
        };

        ActiveCycle {
            stream,
            state,
            buffer: Vec::new(),
            records_received: 0,
            rows_appended: 0,
            rows_rejected: 0,
        }
    }

    /// Appends the buffered records of the open cycle.
    async fn flush(&mut self) -> EtlResult<()> {
        let Some(mut active) = self.current.take() else {
            return Ok(());
        };

        let records = std::mem::take(&mut active.buffer);
        let result = match &mut active.state {
            CycleState::Ready(cycle) if !records.is_empty() => {
                Some(self.loader.append_batch(cycle, records).await)
            }
            _ => None,
        };

        match result {
            Some(Ok(outcome)) => {
                active.rows_appended += outcome.appended;
                active.rows_rejected += outcome.rejections.len();
                self.current = Some(active);

                for rejection in &outcome.rejections {
                    self.sink.emit(rejection).await?;
                }
            }
            Some(Err(err)) => {
                error!(stream = %active.stream, error = %err, "append failed, abandoning cycle");
                active.state = CycleState::Failed(err);
                self.current = Some(active);
            }
            None => self.current = Some(active),
        }

        Ok(())
    }

    /// Flushes and closes the open cycle, merging staging when the stream has a key.
    async fn close_cycle(&mut self) -> EtlResult<()> {
        self.flush().await?;

        let Some(active) = self.current.take() else {
            return Ok(());
        };

        let outcome = match active.state {
            CycleState::Ready(cycle) => match cycle.merge_plan() {
                Some(plan) => match self.reconciler.reconcile(plan).await {
                    Ok(()) => CycleOutcome::Merged,
                    Err(err) => {
                        error!(stream = %active.stream, error = %err, "merge failed, staging table kept");
                        CycleOutcome::Failed(err)
                    }
                },
                None => CycleOutcome::Appended,
            },
            CycleState::Failed(err) => CycleOutcome::Failed(err),
        };

        info!(
            stream = %active.stream,
            records = active.records_received,
            appended = active.rows_appended,
            rejected = active.rows_rejected,
            outcome = outcome.as_str(),
            "closed load cycle"
        );

        self.report.cycles.push(CycleReport {
            stream: active.stream,
            records_received: active.records_received,
            rows_appended: active.rows_appended,
            rows_rejected: active.rows_rejected,
            outcome,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::memory::MemoryDestination;
    use crate::error::ErrorKind;
    use crate::loader::RowRejection;
    use crate::types::{Cell, ColumnDescriptor, StreamSchema, TableName};
    use serde_json::json;

    fn catalog() -> Catalog {
        let stream = |name: &str, key: Vec<String>| {
            StreamSchema::new(
                name,
                TableName::new("public", name),
                vec![
                    ColumnDescriptor::new("id", "integer", "int4"),
                    ColumnDescriptor::new("v", "text", "text"),
                ],
                key,
            )
        };

        Catalog::new(vec![
            stream("a", vec!["id".to_string()]),
            stream("b", Vec::new()),
        ])
        .unwrap()
    }

    fn record(stream: &str, id: i64, v: &str) -> Message {
        Message::Record {
            stream: stream.to_string(),
            record: json!({"id": id, "v": v}).as_object().cloned().unwrap_or_default(),
        }
    }

    fn pipeline(destination: &MemoryDestination) -> LoadPipeline<MemoryDestination, Vec<RowRejection>> {
        LoadPipeline::new(
            catalog(),
            destination.clone(),
            StagingOptions::default(),
            Vec::new(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_change_closes_cycle_and_revisits_start_new_ones() {
        let destination = MemoryDestination::new();
        let mut pipeline = pipeline(&destination);

        for message in [
            record("a", 1, "x"),
            record("b", 1, "y"),
            Message::State { value: json!({"bookmark": 1}) },
            record("a", 1, "z"),
        ] {
            pipeline.handle_message(message).await.unwrap();
        }
        let report = pipeline.finish().await.unwrap();

        let summary: Vec<(&str, &str)> = report
            .cycles
            .iter()
            .map(|cycle| (cycle.stream.as_str(), cycle.outcome.as_str()))
            .collect();
        assert_eq!(summary, [("a", "merged"), ("b", "appended"), ("a", "merged")]);
        assert_eq!(destination.merged_tables().await, ["a", "a"]);

        let rows = destination.table_rows("a").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("v"), Some(&Cell::from("z")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_stream_fails_only_its_cycle() {
        let destination = MemoryDestination::new();
        let mut pipeline = pipeline(&destination);

        pipeline.handle_message(record("ghost", 1, "x")).await.unwrap();
        pipeline.handle_message(record("a", 1, "x")).await.unwrap();
        let report = pipeline.finish().await.unwrap();

        assert_eq!(report.cycles.len(), 2);
        assert_eq!(report.cycles[0].records_received, 1);
        assert!(matches!(
            &report.cycles[0].outcome,
            CycleOutcome::Failed(err) if err.kind() == ErrorKind::MissingStreamSchema
        ));
        assert_eq!(report.cycles[1].outcome, CycleOutcome::Merged);
        assert!(report.has_failures());

        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingStreamSchema);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_input_aborts_without_merging() {
        let destination = MemoryDestination::new();
        let input = "{\"type\":\"RECORD\",\"stream\":\"a\",\"record\":{\"id\":1}}\nnot json\n";

        let err = pipeline(&destination)
            .load_from_reader(input.as_bytes())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeserializationError);
        assert!(destination.merged_tables().await.is_empty());
    }
}
