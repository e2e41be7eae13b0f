//! SurrealDB schema initialization for the tree store
//!
//! The tree is stored one row per top-level node. Each row carries a
//! monotonically increasing `version` that every conditional write checks,
//! which is what gives `transaction` its compare-and-swap semantics.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::storage_traits::StoreResult;

/// Table holding one row per top-level tree node.
pub const TREE_TABLE: &str = "tree_nodes";

/// Initialize the `tree_nodes` table and its unique key index
///
/// Schema:
/// ```text
/// TABLE tree_nodes {
///   node_key:  STRING (unique, first path segment)
///   doc:       STRING (JSON text of the whole subtree)
///   version:   INT    (bumped on every write, compared on every write)
/// }
/// ```
///
/// The subtree is kept as JSON text so arbitrary trees (nulls, empty
/// objects, mixed arrays) round-trip exactly.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> StoreResult<()> {
    debug!("Initializing tree_nodes table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS tree_nodes SCHEMALESS;

        -- One row per top-level node; the unique index turns a racing
        -- CREATE into a detectable conflict
        DEFINE INDEX IF NOT EXISTS idx_tree_node_key ON TABLE tree_nodes COLUMNS node_key UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StoreError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| StoreError::SchemaSetup(e.to_string()))?;

    info!("✓ tree_nodes table initialized");
    Ok(())
}
