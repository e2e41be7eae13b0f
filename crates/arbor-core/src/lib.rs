//! Arbor Core Library
//!
//! Migration support for a hierarchical store whose only atomic primitive is
//! a single-node compare-and-swap.
//!
//! ## Layer 1 - Domain
//!
//! - [`LockService`]: lease mutex so only one executor runs migrations
//! - [`BackupService`]: manual snapshot/restore safety net
//! - [`MigrationRecordStore`]: history of executed migrations
//! - [`TreeHandler`]: the three bundled behind [`MigrationHandler`]

pub mod backup;
pub mod clock;
pub mod error;
pub mod handler;
pub mod lock;
pub mod migration_records;
pub mod obs;
pub mod telemetry;

pub use backup::{BackupConfig, BackupService, NodeSelection};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BackupError, ConfigError, LockError, LockOperation};
pub use handler::{HandlerConfig, MigrationHandler, TreeHandler};
pub use lock::{generate_executor_id, LockConfig, LockRecord, LockService, LockStatus};
pub use migration_records::{MigrationInfo, MigrationRecord, MigrationRecordStore};
pub use telemetry::{init_tracing, LogFormat};

pub use arbor_state::{Keyed, NodePath, StoreConfig, StoreError, SurrealTreeStore, TreeStore};
