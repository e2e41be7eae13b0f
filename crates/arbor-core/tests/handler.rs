//! The handler bundles every service over one store.

use std::sync::Arc;
use std::time::Duration;

use arbor_core::{
    HandlerConfig, LockConfig, LockService, ManualClock, MigrationHandler, MigrationInfo,
    TreeHandler,
};
use arbor_state::fakes::MemoryTreeStore;
use arbor_state::{NodePath, TreeStore};
use serde_json::{json, Value};

async fn migrate_once<H: MigrationHandler>(handler: &H, executor: &str) -> bool {
    let lock = handler.locking_service().expect("locking enabled");
    if !lock.acquire_lock(executor).await.unwrap() {
        return false;
    }

    handler.backup_service().backup().await.unwrap();
    handler
        .data_store()
        .set(&NodePath::parse("users/u1/name").unwrap(), &"Alice")
        .await
        .unwrap();
    handler
        .migration_record_store()
        .save_info(MigrationInfo {
            name: "001_seed".into(),
            timestamp: 1,
            started_at: 10,
            finished_at: 11,
            status: "completed".into(),
        })
        .await
        .unwrap();

    lock.release_lock(executor).await.unwrap();
    true
}

#[tokio::test]
async fn handler_services_share_one_store() {
    let store = Arc::new(MemoryTreeStore::new());
    let handler = TreeHandler::new(Arc::clone(&store), HandlerConfig::default());

    assert!(migrate_once(&handler, "e1").await);

    let dump = store.dump();
    assert_eq!(dump["users"], json!({"u1": {"name": "Alice"}}));
    assert_eq!(dump["migrations"].as_object().unwrap().len(), 1);
    assert!(dump.get("migrations_lock").is_none());
}

#[tokio::test]
async fn locking_can_be_disabled() {
    let store = Arc::new(MemoryTreeStore::new());
    let handler = TreeHandler::new(store, HandlerConfig::default().without_locking());
    assert!(handler.locking_service().is_none());
}

#[tokio::test]
async fn handler_works_over_a_trait_object() {
    let store: Arc<dyn TreeStore> = Arc::new(MemoryTreeStore::new());
    let handler = TreeHandler::new(store, HandlerConfig::default());

    let lock = handler.locking_service().unwrap();
    assert_eq!(lock.lock_path().to_string(), "migrations_lock");
    assert!(lock.ensure_lock_storage_accessible().await.unwrap());
}

#[tokio::test]
async fn restore_does_not_hand_back_a_lock_taken_after_the_backup() {
    let store = Arc::new(MemoryTreeStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let config = HandlerConfig {
        lock: Some(LockConfig::default().with_lease_timeout(Duration::from_millis(1_000))),
        ..HandlerConfig::default()
    };
    let lock_config = config.lock.clone().unwrap();
    let lock_service = LockService::new(Arc::clone(&store), lock_config).with_clock(clock.clone());
    let handler = TreeHandler::new(Arc::clone(&store), config).with_lock_service(lock_service);
    let lock = handler.locking_service().unwrap();
    let backups = handler.backup_service();
    assert_eq!(backups.excluded().to_vec(), vec![lock.lock_path().clone()]);

    assert!(lock.acquire_lock("e1").await.unwrap());
    let snapshot: Value = serde_json::from_str(&backups.backup().await.unwrap()).unwrap();
    assert!(snapshot.get("migrations_lock").is_none());

    clock.advance(Duration::from_millis(2_000));
    assert!(lock.acquire_lock("e2").await.unwrap());

    backups.restore(None).await.unwrap();

    assert!(lock.verify_lock_ownership("e2").await.unwrap());
    assert!(!lock.acquire_lock("e3").await.unwrap());
}

#[tokio::test]
async fn backups_capture_the_lock_node_when_locking_is_off() {
    let store = Arc::new(MemoryTreeStore::with_tree(json!({"migrations_lock": {"k": 1}})));
    let handler = TreeHandler::new(store, HandlerConfig::default().without_locking());

    let snapshot: Value =
        serde_json::from_str(&handler.backup_service().backup().await.unwrap()).unwrap();
    assert_eq!(snapshot, json!({"migrations_lock": {"k": 1}}));
}
