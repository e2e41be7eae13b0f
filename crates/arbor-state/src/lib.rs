//! Arbor-State: tree store client and data access layer
//!
//! This crate is the persistence layer for Arbor. It talks to a hierarchical,
//! schemaless store whose only atomic primitive is a single-key
//! compare-and-swap, and exposes it as a path-addressed tree.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: path addressing, single-key atomicity, identity tagging.
//!
//! ## Key Components
//!
//! - `TreeStore`: get / set / update / transaction against a node path
//! - `SurrealTreeStore`: SurrealDB backend, one row per top-level node
//! - `MemoryTreeStore`: in-memory fake with fault injection (see [`fakes`])
//! - `DataStore` / `Keyed`: collection CRUD with out-of-band storage keys

mod data_access;
mod error;
pub mod fakes;
mod handle;
pub mod migrations;
mod path;
mod retry;
pub mod storage_traits;
pub mod surreal_tree;

pub use data_access::{into_keyed_entries, DataStore, Keyed};
pub use error::StoreError;
pub use handle::StoreConfig;
pub use path::{NodePath, CONNECTION_PROBE_PATH};
pub use retry::CasRetryPolicy;
pub use storage_traits::{StoreResult, TransactionOutcome, TreeStore, UpdateFn};
pub use surreal_tree::SurrealTreeStore;
