//! Structured observability hooks for lock and snapshot lifecycle events.
//!
//! Every state change of the lock or of a snapshot emits one event with a
//! stable `event` field, so log pipelines can filter on it. Filtering is
//! controlled by `ARBOR_LOG` (see [`crate::telemetry`]).

use tracing::{debug, info, warn};

/// Emit event: lock acquired.
///
/// ```ignore
/// emit_lock_acquired("migrations_lock", "host-42-ab12", 1_700_000_300_000);
/// // logs: event=lock.acquired path=migrations_lock executor_id=host-42-ab12 expires_at=...
/// ```
pub fn emit_lock_acquired(path: &str, executor_id: &str, expires_at: i64) {
    info!(
        event = "lock.acquired",
        path = %path,
        executor_id = %executor_id,
        expires_at = expires_at,
    );
}

/// Emit event: lock held by someone else (or committed to another owner).
pub fn emit_lock_contended(path: &str, executor_id: &str, holder: Option<&str>) {
    debug!(
        event = "lock.contended",
        path = %path,
        executor_id = %executor_id,
        holder = holder.unwrap_or("unknown"),
    );
}

/// Emit event: lock released by its owner.
pub fn emit_lock_released(path: &str, executor_id: &str) {
    info!(event = "lock.released", path = %path, executor_id = %executor_id);
}

/// Emit event: lock deleted without an ownership check.
pub fn emit_lock_force_released(path: &str, previous_holder: Option<&str>) {
    warn!(
        event = "lock.force_released",
        path = %path,
        previous_holder = previous_holder.unwrap_or("none"),
    );
}

/// Emit event: an expired lease was cleared.
pub fn emit_lock_expired_cleared(path: &str, previous_holder: &str, expired_at: i64) {
    info!(
        event = "lock.expired_cleared",
        path = %path,
        previous_holder = %previous_holder,
        expired_at = expired_at,
    );
}

/// Emit event: a lease ran out while its holder was still working.
pub fn emit_lock_lease_lost(path: &str, executor_id: &str) {
    warn!(event = "lock.lease_lost", path = %path, executor_id = %executor_id);
}

/// Emit event: snapshot taken.
pub fn emit_backup_taken(nodes: usize, bytes: usize) {
    info!(event = "backup.taken", nodes = nodes, bytes = bytes);
}

/// Emit event: snapshot written back to the store.
pub fn emit_restore_applied(nodes: usize, from_retained: bool) {
    info!(
        event = "backup.restored",
        nodes = nodes,
        from_retained = from_retained,
    );
}
