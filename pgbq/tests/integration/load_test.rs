use chrono::DateTime;
use pgbq::catalog::Catalog;
use pgbq::destination::memory::MemoryDestination;
use pgbq::error::ErrorKind;
use pgbq::loader::{RowRejection, STAGING_SEQUENCE_COLUMN, StagingOptions};
use pgbq::pipeline::{CycleOutcome, LoadPipeline};
use pgbq::test_utils::destination::{FaultyDestination, Operation};
use pgbq::test_utils::record::{ndjson, record_message};
use pgbq::transport::{ErrorRecordWriter, Message};
use pgbq::types::{Cell, ColumnDescriptor, StreamSchema, TableName};
use serde_json::{Value, json};
use telemetry::init_test_tracing;

fn stream(name: &str, primary_key: &[&str]) -> StreamSchema {
    StreamSchema::new(
        name,
        TableName::new("public", name),
        vec![
            ColumnDescriptor::new("id", "integer", "int4"),
            ColumnDescriptor::new("name", "text", "text"),
            ColumnDescriptor::new("updated_at", "timestamp with time zone", "timestamptz"),
            ColumnDescriptor::new("attributes", "jsonb", "jsonb"),
        ],
        primary_key.iter().map(|key| key.to_string()).collect(),
    )
}

fn catalog() -> Catalog {
    Catalog::new(vec![
        stream("users", &["id"]),
        stream("events", &[]),
        stream("orders", &["id"]),
    ])
    .unwrap()
}

fn options(chunk_size: usize) -> StagingOptions {
    StagingOptions {
        chunk_size,
        ..StagingOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn records_are_appended_in_chunks() {
    init_test_tracing();

    let destination = MemoryDestination::new();
    let messages: Vec<Message> = (0..2500)
        .map(|id| record_message("users", json!({"id": id, "name": format!("user {id}")})))
        .collect();

    let report = LoadPipeline::new(catalog(), destination.clone(), options(1000), Vec::new())
        .load_from_reader(ndjson(&messages).as_bytes())
        .await
        .unwrap();

    let sizes: Vec<usize> = destination
        .append_calls()
        .await
        .into_iter()
        .map(|call| call.rows)
        .collect();
    assert_eq!(sizes, [1000, 1000, 500]);

    assert_eq!(report.cycles.len(), 1);
    assert_eq!(report.cycles[0].records_received, 2500);
    assert_eq!(report.cycles[0].rows_appended, 2500);
    assert_eq!(report.cycles[0].outcome, CycleOutcome::Merged);

    assert_eq!(destination.table_rows("users").await.unwrap().len(), 2500);
    assert!(!destination.has_table("temp_table_users").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn insert_only_streams_append_straight_into_target() {
    init_test_tracing();

    let destination = MemoryDestination::new();
    let messages = [
        record_message("events", json!({"id": 1, "name": "signup"})),
        record_message("events", json!({"id": 1, "name": "signup"})),
    ];

    let report = LoadPipeline::new(catalog(), destination.clone(), options(1000), Vec::new())
        .load_from_reader(ndjson(&messages).as_bytes())
        .await
        .unwrap();

    assert_eq!(report.cycles[0].outcome, CycleOutcome::Appended);
    assert_eq!(destination.table_names().await, ["events"]);
    assert!(destination.merged_tables().await.is_empty());

    let rows = destination.table_rows("events").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| !row.contains(STAGING_SEQUENCE_COLUMN)));
}

#[tokio::test(flavor = "multi_thread")]
async fn provisioning_failure_does_not_stop_sibling_streams() {
    init_test_tracing();

    let destination = FaultyDestination::wrap(MemoryDestination::new());
    destination.fail_on(Operation::CreateTable, "users").await;

    let messages = [
        record_message("users", json!({"id": 1, "name": "a"})),
        record_message("users", json!({"id": 2, "name": "b"})),
        record_message("orders", json!({"id": 7, "name": "book"})),
    ];

    let report = LoadPipeline::new(catalog(), destination.clone(), options(1000), Vec::new())
        .load_from_reader(ndjson(&messages).as_bytes())
        .await
        .unwrap();

    assert_eq!(report.cycles.len(), 2);
    assert_eq!(report.cycles[0].records_received, 2);
    assert_eq!(report.cycles[0].rows_appended, 0);
    assert!(matches!(
        &report.cycles[0].outcome,
        CycleOutcome::Failed(err) if err.kind() == ErrorKind::TargetProvisionFailed
    ));
    assert_eq!(report.cycles[1].outcome, CycleOutcome::Merged);

    let memory = destination.wrapped();
    assert!(!memory.has_table("users").await);
    assert_eq!(memory.table_rows("orders").await.unwrap().len(), 1);
    assert_eq!(
        report.into_result().unwrap_err().kind(),
        ErrorKind::TargetProvisionFailed
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_rows_become_error_records() {
    init_test_tracing();

    let destination = MemoryDestination::new();
    let messages = [
        record_message("users", json!({"id": 1, "name": "ok", "nickname": "dropped"})),
        record_message("users", json!({"id": 2, "updated_at": "not a time"})),
        record_message("users", json!({"id": "two", "name": "bad id"})),
        record_message("users", json!({"id": 3, "attributes": {"tier": "gold"}})),
    ];
    let mut output = Vec::new();

    let report = LoadPipeline::new(
        catalog(),
        destination.clone(),
        options(1000),
        ErrorRecordWriter::new(&mut output),
    )
    .load_from_reader(ndjson(&messages).as_bytes())
    .await
    .unwrap();

    assert_eq!(report.cycles[0].rows_appended, 2);
    assert_eq!(report.cycles[0].rows_rejected, 2);
    assert_eq!(report.cycles[0].outcome, CycleOutcome::Merged);

    let error_records: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(error_records.len(), 2);
    for error_record in &error_records {
        assert_eq!(error_record["type"], "RECORD");
        assert_eq!(error_record["stream"], "users");
        assert!(error_record["record"]["error"].is_string());
    }

    let rows = destination.table_rows("users").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].get("attributes"), Some(&Cell::from("{\"tier\":\"gold\"}")));
}

#[tokio::test(flavor = "multi_thread")]
async fn staged_timestamps_are_iso_8601_or_null() {
    init_test_tracing();

    let destination = MemoryDestination::new();
    let timestamps = [
        json!(null),
        json!("2024-02-29 23:59:59.123456"),
        json!("2024-02-29T23:59:59+05:30"),
        json!("2024-02-29"),
        json!(1_700_000_000),
        json!(1_700_000_000.5),
        json!("garbage"),
        json!(false),
    ];
    let messages: Vec<Message> = timestamps
        .iter()
        .enumerate()
        .map(|(id, updated_at)| record_message("events", json!({"id": id, "updated_at": updated_at})))
        .collect();
    let mut rejections: Vec<RowRejection> = Vec::new();

    let mut pipeline = LoadPipeline::new(catalog(), destination.clone(), options(3), &mut rejections);
    for message in messages {
        pipeline.handle_message(message).await.unwrap();
    }
    pipeline.finish().await.unwrap();

    assert_eq!(rejections.len(), 2);
    for row in destination.table_rows("events").await.unwrap() {
        match row.get("updated_at") {
            None | Some(Cell::Null) => {}
            Some(Cell::String(text)) => assert!(DateTime::parse_from_rfc3339(text).is_ok(), "{text}"),
            Some(other) => panic!("unexpected timestamp cell {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_append_abandons_cycle_without_touching_target() {
    init_test_tracing();

    let destination = FaultyDestination::wrap(MemoryDestination::new());
    destination
        .fail_on(Operation::AppendRows, "temp_table_users")
        .await;

    let messages: Vec<Message> = (0..5)
        .map(|id| record_message("users", json!({"id": id})))
        .collect();

    let report = LoadPipeline::new(catalog(), destination.clone(), options(2), Vec::new())
        .load_from_reader(ndjson(&messages).as_bytes())
        .await
        .unwrap();

    assert_eq!(report.cycles[0].records_received, 5);
    assert!(report.cycles[0].is_failed());

    let memory = destination.wrapped();
    assert_eq!(memory.table_rows("users").await.unwrap().len(), 0);
    assert!(memory.merged_tables().await.is_empty());
    assert_eq!(memory.append_calls().await.len(), 0);
}
