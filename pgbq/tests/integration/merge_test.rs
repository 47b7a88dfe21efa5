use pgbq::catalog::Catalog;
use pgbq::destination::Destination;
use pgbq::destination::memory::MemoryDestination;
use pgbq::error::ErrorKind;
use pgbq::loader::{STAGING_SEQUENCE_COLUMN, StagingLoader, StagingOptions};
use pgbq::merge::{MergePlan, MergeReconciler};
use pgbq::pipeline::{CycleOutcome, LoadPipeline};
use pgbq::test_utils::destination::{FaultyDestination, Operation};
use pgbq::test_utils::record::{ndjson, record, record_message};
use pgbq::types::{Cell, ColumnDescriptor, Record, StreamSchema, TableName, TargetColumn, TargetType};
use serde_json::json;
use telemetry::init_test_tracing;

fn items() -> StreamSchema {
    StreamSchema::new(
        "items",
        TableName::new("public", "items"),
        vec![
            ColumnDescriptor::new("id", "integer", "int4"),
            ColumnDescriptor::new("v", "text", "text"),
        ],
        vec!["id".to_string()],
    )
}

fn columns() -> Vec<TargetColumn> {
    vec![
        TargetColumn::scalar("id", TargetType::Int64),
        TargetColumn::scalar("v", TargetType::String),
    ]
}

fn values_by_id(rows: &[Record]) -> Vec<(i64, String)> {
    let mut values: Vec<(i64, String)> = rows
        .iter()
        .filter_map(|row| match (row.get("id"), row.get("v")) {
            (Some(Cell::I64(id)), Some(Cell::String(v))) => Some((*id, v.clone())),
            _ => None,
        })
        .collect();
    values.sort();
    values
}

async fn stage(loader: &StagingLoader<MemoryDestination>, rows: Vec<Record>) -> MergePlan {
    let mut cycle = loader.ensure_tables(&items()).await.unwrap();
    loader.append_batch(&mut cycle, rows).await.unwrap();
    cycle.merge_plan().cloned().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn last_arrival_wins_within_a_key() {
    init_test_tracing();

    let destination = MemoryDestination::new();
    let loader = StagingLoader::new(destination.clone(), StagingOptions::default());

    let plan = stage(
        &loader,
        vec![record(json!({"id": 1, "v": "a"})), record(json!({"id": 1, "v": "b"}))],
    )
    .await;
    MergeReconciler::new(destination.clone())
        .reconcile(&plan)
        .await
        .unwrap();

    let rows = destination.table_rows("items").await.unwrap();
    assert_eq!(values_by_id(&rows), [(1, "b".to_string())]);
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_updates_existing_and_inserts_new_keys() {
    init_test_tracing();

    let destination = MemoryDestination::new();
    destination
        .seed_table("items", columns(), vec![record(json!({"id": 1, "v": "old"}))])
        .await;
    let loader = StagingLoader::new(destination.clone(), StagingOptions::default());

    let plan = stage(
        &loader,
        vec![record(json!({"id": 1, "v": "new"})), record(json!({"id": 2, "v": "x"}))],
    )
    .await;
    MergeReconciler::new(destination.clone())
        .reconcile(&plan)
        .await
        .unwrap();

    let rows = destination.table_rows("items").await.unwrap();
    assert_eq!(
        values_by_id(&rows),
        [(1, "new".to_string()), (2, "x".to_string())]
    );
    assert!(rows.iter().all(|row| !row.contains(STAGING_SEQUENCE_COLUMN)));
}

#[tokio::test(flavor = "multi_thread")]
async fn merging_the_same_staging_twice_is_idempotent() {
    init_test_tracing();

    let destination = MemoryDestination::new();
    let loader = StagingLoader::new(destination.clone(), StagingOptions::default());
    let plan = stage(
        &loader,
        vec![
            record(json!({"id": 1, "v": "a"})),
            record(json!({"id": 2, "v": "b"})),
            record(json!({"id": 1, "v": "c"})),
        ],
    )
    .await;

    destination.execute_merge(&plan).await.unwrap();
    let first = destination.table_rows("items").await.unwrap();

    destination.execute_merge(&plan).await.unwrap();
    let second = destination.table_rows("items").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(values_by_id(&second), [(1, "c".to_string()), (2, "b".to_string())]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_merge_keeps_staging_and_retry_continues_the_sequence() {
    init_test_tracing();

    let destination = FaultyDestination::wrap(MemoryDestination::new());
    destination.fail_on(Operation::ExecuteMerge, "items").await;
    let catalog = Catalog::new(vec![items()]).unwrap();

    let first_run = [
        record_message("items", json!({"id": 1, "v": "first"})),
        record_message("items", json!({"id": 2, "v": "kept"})),
    ];
    let report = LoadPipeline::new(
        catalog.clone(),
        destination.clone(),
        StagingOptions::default(),
        Vec::new(),
    )
    .load_from_reader(ndjson(&first_run).as_bytes())
    .await
    .unwrap();

    assert!(matches!(
        &report.cycles[0].outcome,
        CycleOutcome::Failed(err) if err.kind() == ErrorKind::MergeExecutionFailed
    ));
    let memory = destination.wrapped();
    assert!(memory.has_table("temp_table_items").await);
    assert!(memory.table_rows("items").await.unwrap().is_empty());

    destination.heal().await;

    let second_run = [record_message("items", json!({"id": 1, "v": "second"}))];
    let report = LoadPipeline::new(catalog, destination.clone(), StagingOptions::default(), Vec::new())
        .load_from_reader(ndjson(&second_run).as_bytes())
        .await
        .unwrap();

    assert_eq!(report.cycles[0].outcome, CycleOutcome::Merged);
    assert!(!memory.has_table("temp_table_items").await);
    assert_eq!(
        values_by_id(&memory.table_rows("items").await.unwrap()),
        [(1, "second".to_string()), (2, "kept".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn composite_keys_match_on_every_column() {
    init_test_tracing();

    let schema = StreamSchema::new(
        "memberships",
        TableName::new("public", "memberships"),
        vec![
            ColumnDescriptor::new("user_id", "integer", "int4"),
            ColumnDescriptor::new("group_id", "integer", "int4"),
            ColumnDescriptor::new("role", "text", "text"),
        ],
        vec!["user_id".to_string(), "group_id".to_string()],
    );
    let catalog = Catalog::new(vec![schema]).unwrap();
    let destination = MemoryDestination::new();

    let messages = [
        record_message("memberships", json!({"user_id": 1, "group_id": 1, "role": "member"})),
        record_message("memberships", json!({"user_id": 1, "group_id": 2, "role": "member"})),
        record_message("memberships", json!({"user_id": 1, "group_id": 1, "role": "admin"})),
    ];

    LoadPipeline::new(catalog, destination.clone(), StagingOptions::default(), Vec::new())
        .load_from_reader(ndjson(&messages).as_bytes())
        .await
        .unwrap();

    let rows = destination.table_rows("memberships").await.unwrap();
    assert_eq!(rows.len(), 2);
    let admin = rows
        .iter()
        .find(|row| row.get("group_id") == Some(&Cell::I64(1)))
        .unwrap();
    assert_eq!(admin.get("role"), Some(&Cell::from("admin")));
}

#[tokio::test(flavor = "multi_thread")]
async fn key_sent_as_text_and_as_number_keeps_one_row() {
    init_test_tracing();

    let catalog = Catalog::new(vec![items()]).unwrap();
    let destination = MemoryDestination::new();

    let messages = [
        record_message("items", json!({"id": "1", "v": "a"})),
        record_message("items", json!({"id": 1, "v": "b"})),
    ];

    LoadPipeline::new(catalog, destination.clone(), StagingOptions::default(), Vec::new())
        .load_from_reader(ndjson(&messages).as_bytes())
        .await
        .unwrap();

    let rows = destination.table_rows("items").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(values_by_id(&rows), [(1, "b".to_string())]);
}
