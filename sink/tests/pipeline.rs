#![cfg(feature = "test-utils")]

use std::time::Duration;

use chrono::Utc;
use config::shared::SinkOptions;
use serde_json::{Value, json};
use sink::apply::{Disposition, DropReason, Engine};
use sink::error::{ErrorKind, SinkResult};
use sink::script::{ScriptBuilder, SourceProps, TableProps};
use sink::store::memory::MemoryTargetStore;
use sink::test_utils::document::{delete, doc, row_key, table_name, upsert};
use sink::test_utils::functions::{CountingMap, SlowMap};
use sink::test_utils::schema::table_schema;
use sink::types::Document;
use telemetry::init_test_tracing;

async fn users_store() -> MemoryTargetStore {
    let store = MemoryTargetStore::new();
    store
        .create_table(table_schema("db.users", &["id", "name", "extras"]))
        .await;
    store
}

async fn create_engine(
    builder: ScriptBuilder,
    store: MemoryTargetStore,
) -> Engine<MemoryTargetStore> {
    Engine::new(builder.build(), store).await.unwrap()
}

#[tokio::test]
async fn pass_through_source_writes_documents_unchanged() {
    init_test_tracing();

    let store = users_store().await;
    let engine = create_engine(ScriptBuilder::default(), store.clone()).await;

    let outcomes = engine
        .process_batch("db.users", vec![upsert(json!({"id": 1, "name": "ada"}), 1)])
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].index, 0);
    assert_eq!(outcomes[0].table, Some(table_name("db.users")));
    assert_eq!(outcomes[0].key, Some(row_key(&[json!(1)])));
    assert_eq!(outcomes[0].disposition, Disposition::Applied);
    assert_eq!(
        store.row(&table_name("db.users"), &row_key(&[json!(1)])).await,
        Some(doc(json!({"id": 1, "name": "ada"})))
    );
}

#[tokio::test]
async fn applying_the_same_mutation_twice_is_idempotent() {
    init_test_tracing();

    let store = users_store().await;
    let engine = create_engine(ScriptBuilder::default(), store.clone()).await;
    let mutation = upsert(json!({"id": 1, "name": "ada"}), 1);

    engine
        .process_batch("db.users", vec![mutation.clone()])
        .await
        .unwrap();
    let once = store.rows(&table_name("db.users")).await;

    let outcomes = engine.process_batch("db.users", vec![mutation]).await.unwrap();

    assert!(outcomes[0].is_applied());
    assert_eq!(store.rows(&table_name("db.users")).await, once);
}

#[tokio::test]
async fn outcomes_follow_batch_order() {
    init_test_tracing();

    let store = users_store().await;
    let engine = create_engine(ScriptBuilder::default(), store.clone()).await;

    let batch = (1..=20)
        .map(|id| upsert(json!({"id": id, "name": format!("user {id}")}), id))
        .collect();
    let outcomes = engine.process_batch("db.users", batch).await.unwrap();

    let indexes: Vec<usize> = outcomes.iter().map(|outcome| outcome.index).collect();
    assert_eq!(indexes, (0..20).collect::<Vec<_>>());
    assert_eq!(store.rows(&table_name("db.users")).await.len(), 20);
}

#[tokio::test]
async fn dispatch_returning_null_produces_no_mutations() {
    init_test_tracing();

    let store = users_store().await;
    let mut builder = ScriptBuilder::default();
    builder
        .configure_source(
            "users_feed",
            SourceProps::dispatch(|_doc: &Document, _meta: &Document| -> SinkResult<Value> {
                Ok(Value::Null)
            })
            .deletes_to("db.users"),
        )
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    let outcomes = engine
        .process_batch("users_feed", vec![upsert(json!({"id": 1, "name": "ada"}), 1)])
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].table, None);
    assert_eq!(
        outcomes[0].disposition,
        Disposition::Dropped {
            reason: DropReason::Discarded
        }
    );
    assert!(store.rows(&table_name("db.users")).await.is_empty());
}

#[tokio::test]
async fn dispatch_fans_out_to_several_tables() {
    init_test_tracing();

    let store = users_store().await;
    store
        .create_table(table_schema("db.audit", &["id", "user_id"]))
        .await;

    let mut builder = ScriptBuilder::default();
    builder
        .configure_source(
            "users_feed",
            SourceProps::dispatch(|doc: &Document, _meta: &Document| -> SinkResult<Value> {
                let id = doc.get("id").map(|id| id.to_json()).unwrap_or(Value::Null);
                Ok(json!({
                    "db.users": [doc.to_json()],
                    "db.audit": [{"id": 100, "user_id": id}, {"id": 101, "user_id": id}],
                }))
            })
            .deletes_to("db.users"),
        )
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    let outcomes = engine
        .process_batch("users_feed", vec![upsert(json!({"id": 1, "name": "ada"}), 1)])
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|outcome| outcome.index == 0 && outcome.is_applied()));
    assert_eq!(store.rows(&table_name("db.users")).await.len(), 1);
    assert_eq!(
        store.rows(&table_name("db.audit")).await,
        vec![
            doc(json!({"id": 100, "user_id": 1})),
            doc(json!({"id": 101, "user_id": 1})),
        ]
    );
}

#[tokio::test]
async fn deletes_go_to_the_delete_target() {
    init_test_tracing();

    let store = users_store().await;
    store
        .insert_row(
            &table_name("db.users"),
            row_key(&[json!(1)]),
            doc(json!({"id": 1, "name": "ada"})),
        )
        .await
        .unwrap();

    let map = CountingMap::default();
    let mut builder = ScriptBuilder::default();
    builder
        .configure_source(
            "users_feed",
            SourceProps::dispatch(|_doc: &Document, _meta: &Document| -> SinkResult<Value> {
                panic!("deletes are never dispatched")
            })
            .deletes_to("db.users"),
        )
        .unwrap();
    builder
        .configure_table("db.users", TableProps::default().map(map.clone()))
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    let outcomes = engine
        .process_batch("users_feed", vec![delete(json!(1), 2)])
        .await
        .unwrap();

    assert_eq!(outcomes[0].disposition, Disposition::Deleted);
    assert_eq!(map.calls(), 0);
    assert!(store.rows(&table_name("db.users")).await.is_empty());
}

#[tokio::test]
async fn deletes_without_a_target_fail_the_batch() {
    init_test_tracing();

    let store = users_store().await;
    let mut builder = ScriptBuilder::default();
    builder
        .configure_source(
            "users-feed",
            SourceProps::dispatch(|doc: &Document, _meta: &Document| -> SinkResult<Value> {
                Ok(json!({"db.users": [doc.to_json()]}))
            }),
        )
        .unwrap();
    let engine = create_engine(builder, store).await;

    let err = engine
        .process_batch("users-feed", vec![delete(json!(1), 1)])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MissingDeleteTarget);
}

#[tokio::test]
async fn expired_deadlines_drop_mutations_before_merging() {
    init_test_tracing();

    let store = MemoryTargetStore::new();
    store
        .create_table(table_schema("db.events", &["id", "ts"]))
        .await;
    let mut builder = ScriptBuilder::default();
    builder
        .configure_table("db.events", TableProps::default().deadline("ts", "1h"))
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    let stale = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    let fresh = Utc::now().to_rfc3339();
    let outcomes = engine
        .process_batch(
            "db.events",
            vec![
                upsert(json!({"id": 1, "ts": stale}), 1),
                upsert(json!({"id": 2, "ts": fresh}), 2),
            ],
        )
        .await
        .unwrap();

    assert_eq!(
        outcomes[0].disposition,
        Disposition::Dropped {
            reason: DropReason::Deadline
        }
    );
    assert!(outcomes[1].is_applied());
    assert_eq!(store.rows(&table_name("db.events")).await.len(), 1);
    assert!(store.dlq_entries().await.is_empty());
}

#[tokio::test]
async fn unknown_columns_without_extras_fail_the_batch() {
    init_test_tracing();

    let store = MemoryTargetStore::new();
    store
        .create_table(table_schema("db.users", &["id", "name"]))
        .await;
    let engine = create_engine(ScriptBuilder::default(), store.clone()).await;

    let err = engine
        .process_batch("db.users", vec![upsert(json!({"id": 1, "color": "red"}), 1)])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnknownColumn);
    assert_eq!(err.detail(), Some("db.users.color"));
    assert!(store.rows(&table_name("db.users")).await.is_empty());
}

#[tokio::test]
async fn unknown_columns_are_collected_into_extras() {
    init_test_tracing();

    let store = users_store().await;
    let mut builder = ScriptBuilder::default();
    builder
        .configure_table(
            "db.users",
            TableProps::default().extras("extras").ignore("secret"),
        )
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    engine
        .process_batch(
            "db.users",
            vec![upsert(
                json!({"id": 1, "name": "ada", "color": "red", "secret": "x"}),
                1,
            )],
        )
        .await
        .unwrap();

    assert_eq!(
        store.row(&table_name("db.users"), &row_key(&[json!(1)])).await,
        Some(doc(json!({"id": 1, "name": "ada", "extras": {"color": "red"}})))
    );
}

#[tokio::test]
async fn expressions_are_handed_to_the_store() {
    init_test_tracing();

    let store = users_store().await;
    let mut builder = ScriptBuilder::default();
    builder
        .configure_table(
            "db.users",
            TableProps::default().expr("name", "lower($0)"),
        )
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    engine
        .process_batch("db.users", vec![upsert(json!({"id": 1, "name": "ADA"}), 1)])
        .await
        .unwrap();

    let exprs = store
        .row_expressions(&table_name("db.users"), &row_key(&[json!(1)]))
        .await;
    assert_eq!(exprs.get("name").map(String::as_str), Some("lower($0)"));
}

#[tokio::test]
async fn map_can_discard_or_reject_single_mutations() {
    init_test_tracing();

    let store = users_store().await;
    let mut builder = ScriptBuilder::default();
    builder
        .configure_table(
            "db.users",
            TableProps::default().map(|doc: &Document, _meta: &Document| -> SinkResult<Value> {
                match doc.get("name").and_then(|name| name.as_str()) {
                    Some("skip") => Ok(Value::Null),
                    Some("broken") => Ok(json!([1, 2, 3])),
                    _ => Ok(doc.to_json()),
                }
            }),
        )
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    let outcomes = engine
        .process_batch(
            "db.users",
            vec![
                upsert(json!({"id": 1, "name": "skip"}), 1),
                upsert(json!({"id": 2, "name": "broken"}), 2),
                upsert(json!({"id": 3, "name": "kept"}), 3),
            ],
        )
        .await
        .unwrap();

    assert_eq!(
        outcomes[0].disposition,
        Disposition::Dropped {
            reason: DropReason::Discarded
        }
    );
    assert_eq!(
        outcomes[1].disposition,
        Disposition::Dropped {
            reason: DropReason::Invalid
        }
    );
    assert!(outcomes[2].is_applied());
    assert_eq!(
        store.rows(&table_name("db.users")).await,
        vec![doc(json!({"id": 3, "name": "kept"}))]
    );
}

#[tokio::test]
async fn deletes_find_rows_whose_mapped_key_is_a_float() {
    init_test_tracing();

    let store = users_store().await;
    let mut builder = ScriptBuilder::default();
    builder
        .configure_table(
            "db.users",
            TableProps::default().map(|doc: &Document, _meta: &Document| -> SinkResult<Value> {
                let mut row = doc.to_json();
                if let Some(id) = row.get("id").and_then(Value::as_f64) {
                    row["id"] = json!(id);
                }
                Ok(row)
            }),
        )
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    let outcomes = engine
        .process_batch("db.users", vec![upsert(json!({"id": 1, "name": "a"}), 1)])
        .await
        .unwrap();
    assert_eq!(outcomes[0].key, Some(row_key(&[json!(1)])));
    assert_eq!(store.rows(&table_name("db.users")).await.len(), 1);

    let outcomes = engine
        .process_batch("db.users", vec![delete(json!(1), 2)])
        .await
        .unwrap();
    assert_eq!(outcomes[0].disposition, Disposition::Deleted);
    assert!(store.rows(&table_name("db.users")).await.is_empty());

    let outcomes = engine
        .process_batch(
            "db.users",
            vec![
                upsert(json!({"id": 2, "name": "b"}), 3),
                delete(json!(2), 4),
            ],
        )
        .await
        .unwrap();
    let dispositions: Vec<_> = outcomes.into_iter().map(|outcome| outcome.disposition).collect();
    assert_eq!(dispositions, vec![Disposition::Applied, Disposition::Deleted]);
    assert!(store.rows(&table_name("db.users")).await.is_empty());
}

#[tokio::test]
async fn slow_user_functions_are_dead_lettered() {
    init_test_tracing();

    let store = users_store().await;
    let mut builder = ScriptBuilder::default();
    builder
        .set_options([("userFunctionTimeout", "20ms")])
        .unwrap();
    builder
        .configure_table(
            "db.users",
            TableProps::default().map(SlowMap::new(Duration::from_millis(500))),
        )
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    let outcomes = engine
        .process_batch("db.users", vec![upsert(json!({"id": 1, "name": "ada"}), 1)])
        .await
        .unwrap();

    assert_eq!(outcomes[0].dlq_queue(), Some(SinkOptions::DEFAULT_DLQ));
    let entries = store.dlq(SinkOptions::DEFAULT_DLQ).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source, "db.users");
    assert_eq!(entries[0].table, Some(table_name("db.users")));
    assert!(
        entries[0]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("UserFunctionTimeout"))
    );
    assert!(store.rows(&table_name("db.users")).await.is_empty());
}

#[tokio::test]
async fn nested_documents_are_routed_separately() {
    init_test_tracing();

    let store = MemoryTargetStore::new();
    store.create_table(table_schema("db.tree", &["id"])).await;
    let mut builder = ScriptBuilder::default();
    builder.set_options([("maxRecursionDepth", "2")]).unwrap();
    builder
        .configure_source("db.tree", SourceProps::target("db.tree").recurse(true))
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    let outcomes = engine
        .process_batch(
            "db.tree",
            vec![upsert(json!({"id": 1, "child": {"id": 2, "child": {"id": 3}}}), 1)],
        )
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|outcome| outcome.is_applied()));
    assert_eq!(
        store.rows(&table_name("db.tree")).await,
        vec![
            doc(json!({"id": 1})),
            doc(json!({"id": 2})),
            doc(json!({"id": 3})),
        ]
    );
}

#[tokio::test]
async fn nesting_beyond_the_recursion_limit_is_dropped() {
    init_test_tracing();

    let store = MemoryTargetStore::new();
    store.create_table(table_schema("db.tree", &["id"])).await;
    let mut builder = ScriptBuilder::default();
    builder.set_options([("maxRecursionDepth", "2")]).unwrap();
    builder
        .configure_source("db.tree", SourceProps::target("db.tree").recurse(true))
        .unwrap();
    let engine = create_engine(builder, store.clone()).await;

    let deep = json!({"id": 1, "child": {"id": 2, "child": {"id": 3, "child": {"id": 4}}}});
    let outcomes = engine
        .process_batch("db.tree", vec![upsert(deep, 1)])
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes[0].disposition,
        Disposition::Dropped {
            reason: DropReason::Invalid
        }
    );
    assert!(store.rows(&table_name("db.tree")).await.is_empty());
}

#[tokio::test]
async fn ndjson_changefeeds_are_applied_in_order() {
    init_test_tracing();

    let store = users_store().await;
    let engine = create_engine(ScriptBuilder::default(), store.clone()).await;

    let body = concat!(
        r#"{"after": {"id": 1, "name": "ada"}, "key": [1], "updated": "10.0"}"#,
        "\n\n",
        r#"{"after": {"id": 2, "name": "bob"}, "key": [2], "updated": "11.0"}"#,
        "\n",
        r#"{"after": null, "key": [1], "updated": "12.0"}"#,
        "\n",
    );
    let outcomes = engine
        .process_ndjson(&table_name("db.users"), body)
        .await
        .unwrap();

    let dispositions: Vec<Disposition> = outcomes
        .into_iter()
        .map(|outcome| outcome.disposition)
        .collect();
    assert_eq!(
        dispositions,
        vec![
            Disposition::Applied,
            Disposition::Applied,
            Disposition::Deleted
        ]
    );
    assert_eq!(
        store.rows(&table_name("db.users")).await,
        vec![doc(json!({"id": 2, "name": "bob"}))]
    );
}

#[tokio::test]
async fn misconfigured_tables_are_reported_at_startup() {
    init_test_tracing();

    let store = users_store().await;
    let mut builder = ScriptBuilder::default();
    builder
        .configure_table("db.users", TableProps::default().cas(["version"]))
        .unwrap();
    builder
        .configure_table("db.missing", TableProps::default())
        .unwrap();

    let err = Engine::new(builder.build(), store).await.unwrap_err();

    let mut kinds = err.kinds();
    kinds.sort_by_key(|kind| format!("{kind:?}"));
    assert_eq!(
        kinds,
        vec![ErrorKind::MissingTableSchema, ErrorKind::UnknownColumn]
    );
}
