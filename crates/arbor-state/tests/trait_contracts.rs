//! Trait contract tests for TreeStore.
//!
//! Every check is written once against `&dyn TreeStore` and run against both
//! the in-memory fake and the SurrealDB backend. Any conforming
//! implementation must pass these.

use std::sync::Arc;

use arbor_state::fakes::MemoryTreeStore;
use arbor_state::{NodePath, StoreError, SurrealTreeStore, TreeStore};
use serde_json::{json, Map, Value};

fn p(raw: &str) -> NodePath {
    NodePath::parse(raw).unwrap()
}

fn partial(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

// ===========================================================================
// Shared contract checks
// ===========================================================================

async fn absent_reads_null(store: &dyn TreeStore) {
    assert_eq!(store.get(&p("nothing/here")).await.unwrap(), Value::Null);
}

async fn set_then_get_round_trip(store: &dyn TreeStore) {
    let tree = json!({
        "u1": {"name": "Alice", "tags": [], "meta": {}},
        "u2": {"name": null, "score": 1.5}
    });
    store.set(&p("users"), tree.clone()).await.unwrap();

    assert_eq!(store.get(&p("users")).await.unwrap(), tree);
    assert_eq!(store.get(&p("users/u1/name")).await.unwrap(), json!("Alice"));
    assert_eq!(store.get(&p("users/u1/meta")).await.unwrap(), json!({}));
}

async fn nested_set_creates_parents(store: &dyn TreeStore) {
    store.set(&p("cfg/a/b/c"), json!(3)).await.unwrap();
    assert_eq!(store.get(&p("cfg")).await.unwrap(), json!({"a": {"b": {"c": 3}}}));
}

async fn set_null_removes(store: &dyn TreeStore) {
    store.set(&p("gone/x"), json!(1)).await.unwrap();
    store.set(&p("gone/y"), json!(2)).await.unwrap();
    store.remove(&p("gone/x")).await.unwrap();
    assert_eq!(store.get(&p("gone")).await.unwrap(), json!({"y": 2}));

    store.set(&p("gone"), Value::Null).await.unwrap();
    assert_eq!(store.get(&p("gone")).await.unwrap(), Value::Null);
}

async fn removing_last_child_prunes_parents(store: &dyn TreeStore) {
    store.set(&p("locks/migrations"), json!({"owner": "a"})).await.unwrap();
    store
        .transaction(&p("locks/migrations"), &|_| Some(Value::Null))
        .await
        .unwrap();
    assert_eq!(store.get(&p("locks")).await.unwrap(), Value::Null);

    store.set(&p("deep/a/b/c"), json!(1)).await.unwrap();
    store.set(&p("deep/keep"), json!({})).await.unwrap();
    store.remove(&p("deep/a/b/c")).await.unwrap();
    assert_eq!(store.get(&p("deep")).await.unwrap(), json!({"keep": {}}));

    store
        .update(&p("deep"), partial(json!({"keep": null})))
        .await
        .unwrap();
    assert_eq!(store.get(&p("deep")).await.unwrap(), Value::Null);

    let root = store.get(&NodePath::root()).await.unwrap();
    assert!(root.get("locks").is_none());
    assert!(root.get("deep").is_none());
}

async fn update_merges_shallowly(store: &dyn TreeStore) {
    store
        .set(&p("profile"), json!({"name": "Alice", "age": 30, "addr": {"city": "Oslo"}}))
        .await
        .unwrap();
    store
        .update(
            &p("profile"),
            partial(json!({"age": 31, "addr": {"zip": "0150"}, "name": null})),
        )
        .await
        .unwrap();

    assert_eq!(
        store.get(&p("profile")).await.unwrap(),
        json!({"age": 31, "addr": {"zip": "0150"}})
    );
}

async fn root_update_fans_out(store: &dyn TreeStore) {
    store
        .update(
            &NodePath::root(),
            partial(json!({"left": {"v": 1}, "right/deep": true})),
        )
        .await
        .unwrap();

    assert_eq!(store.get(&p("left/v")).await.unwrap(), json!(1));
    assert_eq!(store.get(&p("right")).await.unwrap(), json!({"deep": true}));
}

async fn transaction_commits_and_aborts(store: &dyn TreeStore) {
    let outcome = store
        .transaction(&p("counter"), &|current| {
            Some(json!(current.as_i64().unwrap_or(0) + 1))
        })
        .await
        .unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.snapshot, json!(1));

    let outcome = store.transaction(&p("counter"), &|_| None).await.unwrap();
    assert!(!outcome.committed);
    assert_eq!(outcome.snapshot, json!(1));
    assert_eq!(store.get(&p("counter")).await.unwrap(), json!(1));
}

async fn transaction_sees_absent_as_null_and_can_delete(store: &dyn TreeStore) {
    let outcome = store
        .transaction(&p("slot/lock"), &|current| {
            assert!(current.is_null());
            Some(json!({"owner": "a"}))
        })
        .await
        .unwrap();
    assert!(outcome.committed);

    let outcome = store
        .transaction(&p("slot/lock"), &|_| Some(Value::Null))
        .await
        .unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.snapshot, Value::Null);
    assert_eq!(store.get(&p("slot/lock")).await.unwrap(), Value::Null);
}

async fn root_and_reserved_writes_rejected(store: &dyn TreeStore) {
    let err = store.set(&NodePath::root(), json!({})).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidPath { .. }));

    let err = store
        .transaction(&NodePath::root(), &|_| None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidPath { .. }));

    let err = store
        .set(&NodePath::connection_probe(), json!(false))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied { .. }));
}

async fn connection_probe_is_true(store: &dyn TreeStore) {
    assert!(store.check_connection().await.unwrap());
    assert_eq!(
        store.get(&NodePath::connection_probe()).await.unwrap(),
        json!(true)
    );
}

async fn concurrent_increments_are_not_lost(store: Arc<dyn TreeStore>) {
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .transaction(&p("race/counter"), &|current| {
                        Some(json!(current.as_i64().unwrap_or(0) + 1))
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    for outcome in futures::future::join_all(tasks).await {
        assert!(outcome.unwrap().committed);
    }
    assert_eq!(store.get(&p("race/counter")).await.unwrap(), json!(4));
}

async fn run_contract(store: Arc<dyn TreeStore>) {
    absent_reads_null(store.as_ref()).await;
    set_then_get_round_trip(store.as_ref()).await;
    nested_set_creates_parents(store.as_ref()).await;
    set_null_removes(store.as_ref()).await;
    removing_last_child_prunes_parents(store.as_ref()).await;
    update_merges_shallowly(store.as_ref()).await;
    root_update_fans_out(store.as_ref()).await;
    transaction_commits_and_aborts(store.as_ref()).await;
    transaction_sees_absent_as_null_and_can_delete(store.as_ref()).await;
    root_and_reserved_writes_rejected(store.as_ref()).await;
    connection_probe_is_true(store.as_ref()).await;
    concurrent_increments_are_not_lost(store).await;
}

// ===========================================================================
// Backends
// ===========================================================================

#[tokio::test]
async fn memory_store_satisfies_contract() {
    run_contract(Arc::new(MemoryTreeStore::new())).await;
}

#[tokio::test]
async fn surreal_store_satisfies_contract() {
    let store = SurrealTreeStore::in_memory().await.unwrap();
    run_contract(Arc::new(store)).await;
}

#[tokio::test]
async fn root_read_returns_every_top_level_node() {
    let store = SurrealTreeStore::in_memory().await.unwrap();
    assert_eq!(store.get(&NodePath::root()).await.unwrap(), Value::Null);

    store.set(&p("a"), json!(1)).await.unwrap();
    store.set(&p("b/c"), json!("x")).await.unwrap();

    assert_eq!(
        store.get(&NodePath::root()).await.unwrap(),
        json!({"a": 1, "b": {"c": "x"}})
    );
}

#[tokio::test]
async fn surreal_schema_init_is_idempotent() {
    let store = SurrealTreeStore::in_memory().await.unwrap();
    store.set(&p("keep"), json!({"v": 1})).await.unwrap();

    store.ensure_schema().await.unwrap();
    store.ensure_schema().await.unwrap();

    assert!(store.check_connection().await.unwrap());
    assert_eq!(store.get(&p("keep/v")).await.unwrap(), json!(1));
}
