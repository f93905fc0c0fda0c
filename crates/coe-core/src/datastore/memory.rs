// # Memory Datastore
//
// In-process implementation of the Datastore trait.
//
// ## Semantics
//
// - One global revision counter; every successful commit bumps it and every
//   node it touched gets the new revision as its version
// - Preconditions of all mutations are checked before anything is applied,
//   so a failed commit leaves the tree untouched
// - Change notifications are broadcast after the commit is applied
//
// ## Test Hooks
//
// `fail_next_commits` and `set_available` inject the failures the engine has
// to survive; `commits` exposes the commit history so tests can assert on
// the number and order of writes.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::DatastoreConfig;
use crate::error::{Error, Result};
use crate::traits::datastore::{
    ChangeKind, ChangeNotification, ChangeStream, CommitInfo, DataPath, Datastore,
    DatastoreFactory, Mutation, Precondition, Snapshot, VersionedNode, WriteTransaction,
};

const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Failure injected into upcoming commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Report `Error::Conflict`, as if another writer won the race
    Conflict,
    /// Report `Error::TransientIo`, as if the backend were unreachable
    Unavailable,
}

/// A successfully applied commit
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    pub revision: u64,
    pub mutations: Vec<Mutation>,
}

impl CommitRecord {
    /// Whether this commit touched `path`
    pub fn touches(&self, path: &DataPath) -> bool {
        self.mutations.iter().any(|m| m.path() == path)
    }
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<DataPath, VersionedNode>,
    revision: u64,
    history: Vec<CommitRecord>,
    injected: VecDeque<InjectedFailure>,
    unavailable: bool,
}

/// In-memory hierarchical datastore
///
/// Clones share the same tree.
#[derive(Debug, Clone)]
pub struct MemoryDatastore {
    inner: Arc<Mutex<Inner>>,
    changes: broadcast::Sender<ChangeNotification>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::with_notification_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }

    /// Create a datastore whose subscribers lag after `capacity` unread
    /// notifications
    pub fn with_notification_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` commits fail with `failure`
    pub fn fail_next_commits(&self, failure: InjectedFailure, count: usize) {
        let mut inner = self.lock();
        inner.injected.extend(std::iter::repeat_n(failure, count));
    }

    /// Toggle availability; while unavailable every call reports `TransientIo`
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Current value at `path`
    pub fn get(&self, path: &DataPath) -> Option<VersionedNode> {
        self.lock().nodes.get(path).cloned()
    }

    /// Unconditional write, as an external controller application would do
    pub fn put(&self, path: impl Into<DataPath>, value: Value) -> Result<CommitInfo> {
        let mut tx = WriteTransaction::new();
        tx.put(path.into(), value, Precondition::Any);
        self.apply(tx, false)
    }

    /// Unconditional delete, as an external controller application would do
    pub fn remove(&self, path: impl Into<DataPath>) -> Result<CommitInfo> {
        let mut tx = WriteTransaction::new();
        tx.delete(path.into(), Precondition::Any);
        self.apply(tx, false)
    }

    /// All applied commits, oldest first
    pub fn commits(&self) -> Vec<CommitRecord> {
        self.lock().history.clone()
    }

    /// Number of applied commits that touched `path`
    pub fn writes_to(&self, path: &DataPath) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|record| record.touches(path))
            .count()
    }

    /// Current global revision
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    fn apply(&self, tx: WriteTransaction, honour_injection: bool) -> Result<CommitInfo> {
        let mut inner = self.lock();

        if inner.unavailable {
            return Err(Error::transient("memory datastore is unavailable"));
        }

        if honour_injection {
            if let Some(failure) = inner.injected.pop_front() {
                let path = tx
                    .mutations()
                    .first()
                    .map(|m| m.path().to_string())
                    .unwrap_or_default();
                return Err(match failure {
                    InjectedFailure::Conflict => Error::conflict(path, "injected conflict"),
                    InjectedFailure::Unavailable => Error::transient("injected outage"),
                });
            }
        }

        for mutation in tx.mutations() {
            let current = inner.nodes.get(mutation.path()).map(|node| node.version);
            let satisfied = match (mutation.precondition(), current) {
                (Precondition::Any, _) => true,
                (Precondition::Absent, None) => true,
                (Precondition::Version(expected), Some(actual)) => expected == actual,
                _ => false,
            };
            if !satisfied {
                return Err(Error::conflict(
                    mutation.path(),
                    format!(
                        "precondition {:?} failed (current version {:?})",
                        mutation.precondition(),
                        current
                    ),
                ));
            }
        }

        if tx.is_empty() {
            return Ok(CommitInfo {
                revision: inner.revision,
                versions: BTreeMap::new(),
            });
        }

        inner.revision += 1;
        let revision = inner.revision;
        let mut versions = BTreeMap::new();
        let mut notifications = Vec::new();

        for mutation in tx.mutations() {
            match mutation {
                Mutation::Put { path, value, .. } => {
                    let previous = inner.nodes.insert(
                        path.clone(),
                        VersionedNode {
                            value: value.clone(),
                            version: revision,
                        },
                    );
                    versions.insert(path.clone(), Some(revision));
                    notifications.push(ChangeNotification {
                        path: path.clone(),
                        kind: if previous.is_some() {
                            ChangeKind::Updated
                        } else {
                            ChangeKind::Added
                        },
                        value: Some(value.clone()),
                        version: revision,
                    });
                }
                Mutation::Delete { path, .. } => {
                    versions.insert(path.clone(), None);
                    if inner.nodes.remove(path).is_some() {
                        notifications.push(ChangeNotification {
                            path: path.clone(),
                            kind: ChangeKind::Removed,
                            value: None,
                            version: revision,
                        });
                    }
                }
            }
        }

        inner.history.push(CommitRecord {
            revision,
            mutations: tx.into_mutations(),
        });
        drop(inner);

        for notification in notifications {
            // No receivers is fine
            let _ = self.changes.send(notification);
        }

        Ok(CommitInfo { revision, versions })
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn read_transaction(&self, prefix: &DataPath) -> Result<Snapshot> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(Error::transient("memory datastore is unavailable"));
        }

        let nodes = inner
            .nodes
            .iter()
            .filter(|(path, _)| prefix.is_prefix_of(path))
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect();
        Ok(Snapshot::new(nodes))
    }

    async fn commit(&self, tx: WriteTransaction) -> Result<CommitInfo> {
        self.apply(tx, true)
    }

    fn subscribe(&self, prefix: &DataPath) -> ChangeStream {
        let prefix = prefix.clone();
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(move |item| {
            match item {
                Ok(notification) if prefix.is_prefix_of(&notification.path) => {
                    Some(Ok(notification))
                }
                Ok(_) => None,
                Err(lagged) => Some(Err(Error::datastore(format!(
                    "change subscription lagged: {}",
                    lagged
                )))),
            }
        });
        Box::pin(stream)
    }

    fn datastore_name(&self) -> &'static str {
        "memory"
    }
}

/// Factory for the `memory` datastore type
pub struct MemoryDatastoreFactory;

impl DatastoreFactory for MemoryDatastoreFactory {
    fn create(&self, config: &DatastoreConfig) -> Result<Arc<dyn Datastore>> {
        match config {
            DatastoreConfig::Memory => Ok(Arc::new(MemoryDatastore::new())),
            other => Err(Error::config(format!(
                "memory datastore factory cannot build '{}'",
                other.type_name()
            ))),
        }
    }
}
