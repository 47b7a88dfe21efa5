use pgbq::catalog::{Catalog, KeyPolicy, configured_tables, discover_catalog};
use pgbq::error::ErrorKind;
use pgbq::test_utils::introspector::StaticIntrospector;
use pgbq::types::{ColumnDescriptor, Multiplicity, TableName, TargetType};
use telemetry::init_test_tracing;

fn introspector() -> StaticIntrospector {
    StaticIntrospector::new()
        .with_table(
            TableName::new("public", "customers"),
            vec![
                ColumnDescriptor::new("id", "bigint", "int8"),
                ColumnDescriptor::new("email", "character varying", "varchar"),
                ColumnDescriptor::new("scores", "ARRAY", "_int4"),
                ColumnDescriptor::new("balance", "money", "money"),
                ColumnDescriptor::new("profile", "jsonb", "jsonb"),
            ],
        )
        .with_table(
            TableName::new("sales", "orders"),
            vec![
                ColumnDescriptor::new("order_id", "uuid", "uuid"),
                ColumnDescriptor::new("placed_at", "timestamp without time zone", "timestamp"),
            ],
        )
}

fn temp_catalog_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("pgbq-{name}-{}.json", std::process::id()))
}

#[tokio::test(flavor = "multi_thread")]
async fn discovered_catalog_survives_persistence() {
    init_test_tracing();

    let tables = [
        TableName::new("public", "customers"),
        TableName::new("sales", "orders"),
    ];
    let policy = KeyPolicy::default().with_override("orders", vec!["order_id".to_string()]);

    let catalog = discover_catalog(&introspector(), &tables, &policy)
        .await
        .unwrap();

    let path = temp_catalog_path("round-trip");
    catalog.store(&path).await.unwrap();
    let loaded = Catalog::load(&path).await.unwrap();
    tokio::fs::remove_file(&path).await.unwrap();

    assert_eq!(loaded, catalog);

    let customers = loaded.require("customers").unwrap();
    assert_eq!(customers.primary_key, ["id"]);
    for (original, reloaded) in catalog.streams()[0].columns.iter().zip(&customers.columns) {
        assert_eq!(original.data_type, reloaded.data_type);
        assert_eq!(original.udt_name, reloaded.udt_name);
    }

    let columns = customers.target_columns();
    assert_eq!(columns[2].target_type, TargetType::Int64);
    assert_eq!(columns[2].multiplicity, Multiplicity::Repeated);
    assert_eq!(columns[3].target_type, TargetType::String);
    assert_eq!(columns[3].multiplicity, Multiplicity::Scalar);
    assert!(columns[4].needs_serialization);

    let orders = loaded.require("orders").unwrap();
    assert_eq!(orders.table_name, TableName::new("sales", "orders"));
    assert_eq!(orders.primary_key, ["order_id"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_discovery_persists_nothing() {
    init_test_tracing();

    let introspector = introspector().failing_on(TableName::new("sales", "orders"));
    let tables = [
        TableName::new("public", "customers"),
        TableName::new("sales", "orders"),
    ];
    let path = temp_catalog_path("failed-discovery");

    let result = discover_catalog(&introspector, &tables, &KeyPolicy::default()).await;
    if let Ok(catalog) = &result {
        catalog.store(&path).await.unwrap();
    }

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaIntrospectionFailed);
    assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn configured_tables_feed_discovery() {
    init_test_tracing();

    let config: config::shared::DiscoveryConfig = serde_json::from_value(serde_json::json!({
        "tables": ["customers", "orders"],
        "schemas": {"orders": "sales"},
        "primary_keys": {"orders": ["order_id"]}
    }))
    .unwrap();

    let catalog = discover_catalog(
        &introspector(),
        &configured_tables(&config),
        &KeyPolicy::from_config(&config),
    )
    .await
    .unwrap();

    let ids: Vec<&str> = catalog
        .streams()
        .iter()
        .map(|stream| stream.stream_id.as_str())
        .collect();
    assert_eq!(ids, ["customers", "orders"]);
    assert_eq!(catalog.require("orders").unwrap().primary_key, ["order_id"]);
}
