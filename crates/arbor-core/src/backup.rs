//! Snapshot/restore of whole or partial subtrees.
//!
//! A snapshot is a JSON object keyed by node path, one entry per backed-up
//! node, with no envelope. The service keeps the most recent snapshot in
//! memory until it is deleted or replaced. Restore is a full overwrite of
//! every node the snapshot names; nodes it does not name are left alone.
//!
//! Excluded nodes (the lock node, when a lock is configured) are never
//! captured and never written. Restore uses plain writes, so a snapshot
//! entry covering the lock would clobber a lease taken after the backup.

use std::sync::{Arc, Mutex, MutexGuard};

use arbor_state::{NodePath, TreeStore};
use futures::future::try_join_all;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::error::{BackupError, ConfigError};
use crate::obs;

pub const BACKUP_NODES_ENV: &str = "ARBOR_BACKUP_NODES";

/// Which nodes a backup covers.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NodeSelection {
    /// Every top-level node.
    #[default]
    All,
    /// Exactly these subtrees.
    Only(Vec<NodePath>),
}

impl NodeSelection {
    /// Parse a comma-separated list of paths. Blank or `*` selects all.
    pub fn parse_list(raw: &str) -> Result<Self, arbor_state::StoreError> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*" {
            return Ok(NodeSelection::All);
        }
        let paths = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(NodePath::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NodeSelection::Only(paths))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BackupConfig {
    pub nodes: NodeSelection,
    /// Subtrees kept out of every snapshot and every restore.
    pub excluded: Vec<NodePath>,
}

impl BackupConfig {
    pub fn excluding(mut self, path: NodePath) -> Self {
        if !self.excluded.contains(&path) {
            self.excluded.push(path);
        }
        self
    }

    /// Read `ARBOR_BACKUP_NODES`; unset means every node.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(BACKUP_NODES_ENV) {
            Ok(raw) => Ok(Self {
                nodes: NodeSelection::parse_list(&raw).map_err(|source| ConfigError::Path {
                    var: BACKUP_NODES_ENV,
                    source,
                })?,
                excluded: Vec::new(),
            }),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Takes, retains and restores snapshots.
pub struct BackupService<S: ?Sized> {
    store: Arc<S>,
    nodes: NodeSelection,
    excluded: Vec<NodePath>,
    retained: Mutex<Option<String>>,
}

impl<S> BackupService<S>
where
    S: TreeStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: BackupConfig) -> Self {
        Self {
            store,
            nodes: config.nodes,
            excluded: config.excluded,
            retained: Mutex::new(None),
        }
    }

    pub fn nodes(&self) -> &NodeSelection {
        &self.nodes
    }

    pub fn excluded(&self) -> &[NodePath] {
        &self.excluded
    }

    /// Snapshot the configured nodes.
    pub async fn backup(&self) -> Result<String, BackupError> {
        self.backup_nodes(&self.nodes).await
    }

    /// Snapshot `selection`, retain it, and return the serialized form.
    #[instrument(skip(self))]
    pub async fn backup_nodes(&self, selection: &NodeSelection) -> Result<String, BackupError> {
        let snapshot = match selection {
            NodeSelection::All => {
                let mut snapshot = Map::new();
                if let Value::Object(tree) = self.store.get(&NodePath::root()).await? {
                    for (key, value) in tree {
                        self.capture(NodePath::root().child(&key)?, value, &mut snapshot);
                    }
                }
                snapshot
            }
            NodeSelection::Only(paths) => {
                for path in paths {
                    self.ensure_not_excluded(path)?;
                }
                let reads = paths.iter().map(|path| async move {
                    let value = self.store.get(path).await?;
                    Ok::<_, BackupError>((path.to_string(), value))
                });
                try_join_all(reads).await?.into_iter().collect()
            }
        };

        let nodes = snapshot.len();
        let serialized = serde_json::to_string(&Value::Object(snapshot))
            .map_err(|e| BackupError::InvalidSnapshot(e.to_string()))?;
        obs::emit_backup_taken(nodes, serialized.len());

        *self.retained() = Some(serialized.clone());
        Ok(serialized)
    }

    /// Write `snapshot`, or the retained one, back to the store.
    #[instrument(skip(self, snapshot), fields(explicit = snapshot.is_some()))]
    pub async fn restore(&self, snapshot: Option<&str>) -> Result<(), BackupError> {
        let from_retained = snapshot.is_none();
        let source = match snapshot {
            Some(raw) => raw.to_string(),
            None => self
                .retained()
                .clone()
                .ok_or(BackupError::NoBackupAvailable)?,
        };

        let entries = parse_snapshot(&source)?;
        for (path, _) in &entries {
            self.ensure_not_excluded(path)?;
        }
        let nodes = entries.len();
        let writes = entries
            .into_iter()
            .map(|(path, value)| async move { self.store.set(&path, value).await });
        try_join_all(writes).await?;

        obs::emit_restore_applied(nodes, from_retained);
        Ok(())
    }

    /// Add `value` at `path` to `snapshot`, splitting ancestors of excluded
    /// nodes into their children so the excluded subtree is left out.
    fn capture(&self, path: NodePath, value: Value, snapshot: &mut Map<String, Value>) {
        if self.excluded.iter().any(|ex| path.starts_with(ex)) {
            debug!(%path, "excluded node left out of snapshot");
            return;
        }
        if !self.excluded.iter().any(|ex| ex.starts_with(&path)) {
            snapshot.insert(path.to_string(), value);
            return;
        }

        let Value::Object(children) = value else {
            debug!(%path, "non-object ancestor of an excluded node left out of snapshot");
            return;
        };
        for (key, child) in children {
            match path.child(&key) {
                Ok(child_path) => self.capture(child_path, child, snapshot),
                Err(e) => debug!(%path, key = %key, error = %e, "unaddressable child skipped"),
            }
        }
    }

    fn ensure_not_excluded(&self, path: &NodePath) -> Result<(), BackupError> {
        match self.excluded.iter().find(|ex| path.overlaps(ex)) {
            Some(excluded) => Err(BackupError::ExcludedNode {
                path: path.to_string(),
                excluded: excluded.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Forget the retained snapshot.
    pub fn delete_backup(&self) {
        if self.retained().take().is_some() {
            debug!("retained snapshot dropped");
        }
    }

    pub fn current_snapshot(&self) -> Option<String> {
        self.retained().clone()
    }

    pub fn has_backup(&self) -> bool {
        self.retained().is_some()
    }

    fn retained(&self) -> MutexGuard<'_, Option<String>> {
        self.retained.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Decode a serialized snapshot into `(path, value)` writes.
fn parse_snapshot(raw: &str) -> Result<Vec<(NodePath, Value)>, BackupError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| BackupError::InvalidSnapshot(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(BackupError::InvalidSnapshot(
            "snapshot must be a JSON object keyed by node path".to_string(),
        ));
    };

    map.into_iter()
        .map(|(key, value)| {
            let path = NodePath::parse(&key)
                .map_err(|e| BackupError::InvalidSnapshot(e.to_string()))?;
            if path.is_root() || path.is_reserved() {
                return Err(BackupError::InvalidSnapshot(format!(
                    "snapshot entry `{key}` does not name a writable node"
                )));
            }
            Ok((path, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_lists() {
        assert_eq!(NodeSelection::parse_list("").unwrap(), NodeSelection::All);
        assert_eq!(NodeSelection::parse_list(" * ").unwrap(), NodeSelection::All);

        let NodeSelection::Only(paths) = NodeSelection::parse_list("users, config/app ,").unwrap()
        else {
            panic!("expected explicit selection");
        };
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1].to_string(), "config/app");

        assert!(NodeSelection::parse_list("a$b").is_err());
    }

    #[test]
    fn snapshot_must_be_an_object_of_writable_paths() {
        assert!(matches!(
            parse_snapshot("[1, 2]"),
            Err(BackupError::InvalidSnapshot(_))
        ));
        assert!(matches!(
            parse_snapshot("{\"\": 1}"),
            Err(BackupError::InvalidSnapshot(_))
        ));
        assert!(matches!(
            parse_snapshot("{\".info/connected\": false}"),
            Err(BackupError::InvalidSnapshot(_))
        ));
        assert!(matches!(
            parse_snapshot("not json"),
            Err(BackupError::InvalidSnapshot(_))
        ));

        let writes = parse_snapshot("{\"users/u1\": {\"name\": \"Alice\"}, \"gone\": null}").unwrap();
        assert_eq!(writes.len(), 2);
    }
}
