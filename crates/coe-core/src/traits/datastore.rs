// # Datastore Trait
//
// Defines the interface to the controller's network-state store: a
// hierarchical, versioned tree of JSON nodes with optimistic write
// transactions and subtree change subscriptions.
//
// ## Implementations
//
// - In-memory: `coe_core::datastore::MemoryDatastore`
// - RESTCONF: `coe-datastore-restconf` crate
//
// ## Usage
//
// ```rust,ignore
// use coe_core::traits::{DataPath, Datastore, Precondition};
//
// let path = DataPath::new("coe/bindings/pod/a/w1");
// let snapshot = datastore.read_transaction(&path).await?;
//
// let mut tx = datastore.write_transaction();
// match snapshot.get(&path) {
//     Some(node) => tx.put(path, value, Precondition::Version(node.version)),
//     None => tx.put(path, value, Precondition::Absent),
// };
// datastore.commit(tx).await?; // Error::Conflict if someone else wrote first
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

/// Slash-separated path into the datastore tree
///
/// Paths are normalized: no leading, trailing or repeated separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPath(String);

impl DataPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        let normalized = path
            .as_ref()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// Append one segment
    pub fn child(&self, segment: &str) -> Self {
        if self.0.is_empty() {
            Self::new(segment)
        } else {
            Self::new(format!("{}/{}", self.0, segment))
        }
    }

    /// Segment-wise prefix test (`a/b` is a prefix of `a/b/c`, not of `a/bc`)
    pub fn is_prefix_of(&self, other: &DataPath) -> bool {
        self.relative_to_inner(other).is_some()
    }

    /// Segments of `self` below `prefix`, or `None` when `prefix` does not contain `self`
    pub fn relative_to(&self, prefix: &DataPath) -> Option<Vec<&str>> {
        prefix.relative_to_inner(self)
    }

    fn relative_to_inner<'a>(&self, other: &'a DataPath) -> Option<Vec<&'a str>> {
        let mut theirs = other.segments();
        for ours in self.segments() {
            if theirs.next()? != ours {
                return None;
            }
        }
        Some(theirs.collect())
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// A stored node together with the revision that last wrote it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedNode {
    pub value: Value,
    pub version: u64,
}

/// Consistent read-only view of a subtree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    nodes: BTreeMap<DataPath, VersionedNode>,
}

impl Snapshot {
    pub fn new(nodes: BTreeMap<DataPath, VersionedNode>) -> Self {
        Self { nodes }
    }

    pub fn get(&self, path: &DataPath) -> Option<&VersionedNode> {
        self.nodes.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DataPath, &VersionedNode)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Optimistic-concurrency guard on a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Apply unconditionally
    Any,
    /// The node must not exist
    Absent,
    /// The node must exist at exactly this version
    Version(u64),
}

/// One change inside a write transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put {
        path: DataPath,
        value: Value,
        precondition: Precondition,
    },
    Delete {
        path: DataPath,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn path(&self) -> &DataPath {
        match self {
            Mutation::Put { path, .. } | Mutation::Delete { path, .. } => path,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Put { precondition, .. } | Mutation::Delete { precondition, .. } => {
                *precondition
            }
        }
    }
}

/// Batch of mutations committed atomically
///
/// Either every mutation is applied or none is; partial writes are never
/// observable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteTransaction {
    mutations: Vec<Mutation>,
}

impl WriteTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, path: DataPath, value: Value, precondition: Precondition) -> &mut Self {
        self.mutations.push(Mutation::Put {
            path,
            value,
            precondition,
        });
        self
    }

    pub fn delete(&mut self, path: DataPath, precondition: Precondition) -> &mut Self {
        self.mutations.push(Mutation::Delete { path, precondition });
        self
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Outcome of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Datastore revision assigned to the commit
    pub revision: u64,
    /// New version of each touched path (`None` for deletions)
    pub versions: BTreeMap<DataPath, Option<u64>>,
}

impl CommitInfo {
    pub fn version_of(&self, path: &DataPath) -> Option<u64> {
        self.versions.get(path).copied().flatten()
    }
}

/// What happened to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// Notification delivered to subtree subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub path: DataPath,
    pub kind: ChangeKind,
    /// New value (`None` when removed)
    pub value: Option<Value>,
    /// Revision that produced this change
    pub version: u64,
}

/// Stream of change notifications
///
/// An `Err` item means notifications were lost (subscriber lagged or the
/// backend could not poll); subscribers should resynchronize.
pub type ChangeStream = Pin<Box<dyn Stream<Item = crate::Result<ChangeNotification>> + Send + 'static>>;

/// Trait for datastore implementations
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Responsibilities
///
/// - Enforce preconditions atomically at commit time (report `Error::Conflict`)
/// - Report unreachable backends as `Error::TransientIo`
/// - Never retry internally; the engine owns retry and backoff
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Read a consistent snapshot of every node at or below `prefix`
    async fn read_transaction(&self, prefix: &DataPath) -> crate::Result<Snapshot>;

    /// Start a new write transaction
    fn write_transaction(&self) -> WriteTransaction {
        WriteTransaction::new()
    }

    /// Commit a write transaction
    ///
    /// # Returns
    ///
    /// - `Ok(CommitInfo)`: all mutations applied
    /// - `Err(Error::Conflict)`: a precondition failed, nothing applied
    /// - `Err(Error::TransientIo)`: backend unreachable, nothing applied
    async fn commit(&self, tx: WriteTransaction) -> crate::Result<CommitInfo>;

    /// Subscribe to changes at or below `prefix`
    ///
    /// Dropping the stream ends the subscription.
    fn subscribe(&self, prefix: &DataPath) -> ChangeStream;

    /// Backend name (for logging)
    fn datastore_name(&self) -> &'static str;
}

/// Helper trait for constructing datastores from configuration
pub trait DatastoreFactory: Send + Sync {
    fn create(&self, config: &crate::config::DatastoreConfig) -> crate::Result<Arc<dyn Datastore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_normalization() {
        assert_eq!(DataPath::new("/coe//bindings/").as_str(), "coe/bindings");
        assert_eq!(DataPath::new("").child("coe").as_str(), "coe");
    }

    #[test]
    fn prefix_is_segment_wise() {
        let prefix = DataPath::new("coe/bind");

        assert!(prefix.is_prefix_of(&DataPath::new("coe/bind/x")));
        assert!(prefix.is_prefix_of(&DataPath::new("coe/bind")));
        assert!(!prefix.is_prefix_of(&DataPath::new("coe/bindings/x")));
        assert_eq!(
            DataPath::new("coe/bind/pod/a").relative_to(&prefix),
            Some(vec!["pod", "a"])
        );
    }
}
