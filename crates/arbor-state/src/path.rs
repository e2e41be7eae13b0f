//! Node paths and in-document tree edits
//!
//! A [`NodePath`] addresses a subtree of the store. The helpers at the bottom
//! of this module apply reads and writes to a `serde_json::Value` document
//! with tree-store semantics: writing `null` removes a node, and writing
//! below a scalar replaces it with an object.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::storage_traits::StoreResult;

/// Reserved, always-present, read-only path used for connectivity probes.
pub const CONNECTION_PROBE_PATH: &str = ".info/connected";

const RESERVED_ROOT: &str = ".info";
const FORBIDDEN_CHARS: [char; 5] = ['.', '#', '$', '[', ']'];

/// Validated `/`-separated address of a node in the tree.
///
/// Empty segments are dropped, so `"/users//u1/"` and `"users/u1"` are the
/// same path. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NodePath {
    segments: Vec<String>,
}

impl NodePath {
    /// The root of the tree.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse and validate a path string.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let segments: Vec<String> = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        for (i, segment) in segments.iter().enumerate() {
            if i == 0 && segment == RESERVED_ROOT {
                continue;
            }
            if let Some(c) = segment
                .chars()
                .find(|c| FORBIDDEN_CHARS.contains(c) || c.is_ascii_control())
            {
                return Err(StoreError::invalid_path(
                    raw,
                    format!("segment `{segment}` contains forbidden character {c:?}"),
                ));
            }
        }

        Ok(Self { segments })
    }

    /// The reserved connectivity probe path.
    pub fn connection_probe() -> Self {
        Self {
            segments: vec![RESERVED_ROOT.to_string(), "connected".to_string()],
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True for paths under the read-only `.info` namespace.
    pub fn is_reserved(&self) -> bool {
        self.head() == Some(RESERVED_ROOT)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment: the top-level node this path lives under.
    pub fn head(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Segments below the top-level node (empty for root and top-level paths).
    pub fn tail(&self) -> &[String] {
        self.segments.get(1..).unwrap_or(&[])
    }

    /// Last segment: the storage key of the node.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Append a single validated segment.
    pub fn child(&self, segment: &str) -> StoreResult<Self> {
        let parsed = Self::parse(segment)?;
        if parsed.segments.len() != 1 || parsed.is_reserved() {
            return Err(StoreError::invalid_path(
                segment,
                "child must be exactly one plain segment",
            ));
        }
        Ok(self.join(&parsed))
    }

    /// Concatenate two paths.
    pub fn join(&self, other: &NodePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// True when `self` is `prefix` or lies below it.
    pub fn starts_with(&self, prefix: &NodePath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// True when either path contains the other.
    pub fn overlaps(&self, other: &NodePath) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, parents) = self.segments.split_last()?;
        Some(Self {
            segments: parents.to_vec(),
        })
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl FromStr for NodePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for NodePath {
    type Error = StoreError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Document edits
// ---------------------------------------------------------------------------

/// Borrow the value at `segments`, if present.
pub(crate) fn value_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

/// Write `value` at `segments`; `null` removes the node and prunes the
/// ancestors it leaves empty.
///
/// Returns `true` when a removal emptied `root` itself, so the caller can
/// drop the whole document.
pub(crate) fn write_at(root: &mut Value, segments: &[String], value: Value) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return false;
    };

    if value.is_null() {
        return remove_at(root, segments);
    }

    let mut node = root;
    for segment in parents {
        node = ensure_object(node)
            .entry(segment.clone())
            .or_insert(Value::Null);
    }
    ensure_object(node).insert(last.clone(), value);
    false
}

/// Remove the node at `segments`. Returns `true` if `node` was left empty
/// by the removal; pre-existing empty objects are kept.
fn remove_at(node: &mut Value, segments: &[String]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return false;
    };
    let Some(map) = node.as_object_mut() else {
        return false;
    };

    if rest.is_empty() {
        if map.remove(first).is_none() {
            return false;
        }
    } else {
        let child_emptied = match map.get_mut(first) {
            Some(child) => remove_at(child, rest),
            None => false,
        };
        if !child_emptied {
            return false;
        }
        map.remove(first);
    }
    map.is_empty()
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        unreachable!("node was just replaced by an object")
    };
    map
}

/// Resolve the keys of a partial update against `base` and group the writes
/// by top-level node. Keys may themselves be multi-segment paths.
pub(crate) fn group_writes(
    base: &NodePath,
    partial: Map<String, Value>,
) -> StoreResult<BTreeMap<String, Vec<(Vec<String>, Value)>>> {
    let mut grouped: BTreeMap<String, Vec<(Vec<String>, Value)>> = BTreeMap::new();

    for (key, value) in partial {
        let relative = NodePath::parse(&key)?;
        if relative.is_root() {
            return Err(StoreError::invalid_path(key, "update key must not be empty"));
        }
        let target = base.join(&relative);
        if relative.is_reserved() || target.is_reserved() {
            return Err(StoreError::PermissionDenied {
                path: target.to_string(),
                reason: "the .info namespace is read-only".to_string(),
            });
        }
        let Some(head) = target.head() else {
            continue;
        };
        grouped
            .entry(head.to_string())
            .or_default()
            .push((target.tail().to_vec(), value));
    }

    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segs(raw: &str) -> Vec<String> {
        NodePath::parse(raw).unwrap().segments().to_vec()
    }

    #[test]
    fn parse_drops_empty_segments() {
        let path = NodePath::parse("/users//u1/").unwrap();
        assert_eq!(path.to_string(), "users/u1");
        assert_eq!(path.head(), Some("users"));
        assert_eq!(path.key(), Some("u1"));
        assert!(NodePath::parse("").unwrap().is_root());
    }

    #[test]
    fn parse_rejects_forbidden_characters() {
        for bad in ["a.b", "users/$id", "x#y", "list[0]", "tab\there"] {
            let err = NodePath::parse(bad).unwrap_err();
            assert!(matches!(err, StoreError::InvalidPath { .. }), "{bad}");
        }
    }

    #[test]
    fn reserved_prefix_is_only_allowed_first() {
        assert!(NodePath::parse(CONNECTION_PROBE_PATH).unwrap().is_reserved());
        assert!(NodePath::parse("users/.info").is_err());
        assert_eq!(
            NodePath::connection_probe(),
            NodePath::parse(CONNECTION_PROBE_PATH).unwrap()
        );
    }

    #[test]
    fn child_requires_single_segment() {
        let base = NodePath::parse("migrations").unwrap();
        assert_eq!(base.child("k1").unwrap().to_string(), "migrations/k1");
        assert!(base.child("a/b").is_err());
        assert!(base.child("").is_err());
    }

    #[test]
    fn parent_and_tail() {
        let path = NodePath::parse("a/b/c").unwrap();
        assert_eq!(path.parent().unwrap().to_string(), "a/b");
        assert_eq!(path.tail(), &["b".to_string(), "c".to_string()]);
        assert!(NodePath::root().parent().is_none());
    }

    #[test]
    fn write_creates_intermediate_objects() {
        let mut doc = Value::Null;
        write_at(&mut doc, &segs("a/b/c"), json!(1));
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));

        write_at(&mut doc, &segs("a/b/c/d"), json!("deep"));
        assert_eq!(doc, json!({"a": {"b": {"c": {"d": "deep"}}}}));
    }

    #[test]
    fn write_null_removes_without_creating() {
        let mut doc = json!({"a": {"b": 1, "c": 2}});
        write_at(&mut doc, &segs("a/b"), Value::Null);
        assert_eq!(doc, json!({"a": {"c": 2}}));

        write_at(&mut doc, &segs("x/y"), Value::Null);
        assert_eq!(doc, json!({"a": {"c": 2}}));
    }

    #[test]
    fn removing_last_child_prunes_empty_ancestors() {
        let mut doc = json!({"locks": {"migrations": {"owner": "a"}}, "keep": {}});
        let emptied = write_at(&mut doc, &segs("locks/migrations"), Value::Null);
        assert!(!emptied);
        assert_eq!(doc, json!({"keep": {}}));

        let mut node = json!({"a": {"b": {"c": 1}}});
        assert!(write_at(&mut node, &segs("a/b/c"), Value::Null));
        assert_eq!(node, json!({}));

        let mut node = json!({"a": {}, "b": 1});
        assert!(!write_at(&mut node, &segs("a/missing"), Value::Null));
        assert_eq!(node, json!({"a": {}, "b": 1}));
    }

    #[test]
    fn prefix_and_overlap() {
        let lock = NodePath::parse("locks/migrations").unwrap();
        assert!(NodePath::parse("locks/migrations/owner").unwrap().starts_with(&lock));
        assert!(lock.starts_with(&lock));
        assert!(!NodePath::parse("locks/other").unwrap().starts_with(&lock));
        assert!(NodePath::parse("locks").unwrap().overlaps(&lock));
        assert!(NodePath::root().overlaps(&lock));
        assert!(!NodePath::parse("lockset").unwrap().overlaps(&lock));
    }

    #[test]
    fn value_at_walks_objects_only() {
        let doc = json!({"a": {"b": [1, 2]}});
        assert_eq!(value_at(&doc, &segs("a/b")), Some(&json!([1, 2])));
        assert_eq!(value_at(&doc, &segs("a/b/0")), None);
        assert_eq!(value_at(&doc, &[]), Some(&doc));
    }

    #[test]
    fn group_writes_splits_by_top_level_node() {
        let mut partial = Map::new();
        partial.insert("users/u1".into(), json!({"name": "Alice"}));
        partial.insert("config".into(), json!(true));

        let grouped = group_writes(&NodePath::root(), partial).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["users"][0].0, vec!["u1".to_string()]);
        assert!(grouped["config"][0].0.is_empty());
    }
}
