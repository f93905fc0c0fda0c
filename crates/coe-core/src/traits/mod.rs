//! Core traits for the COE reconciler
//!
//! This module defines the abstract interfaces the engine consumes.
//!
//! - [`Datastore`]: Transactional, hierarchical network-state store
//! - [`EventSource`]: Restartable orchestration event feed
//! - [`CheckpointStore`]: Persistent processed-event watermark

pub mod checkpoint_store;
pub mod datastore;
pub mod event_source;

pub use checkpoint_store::{Checkpoint, CheckpointStore, CheckpointStoreFactory};
pub use datastore::{
    ChangeKind, ChangeNotification, ChangeStream, CommitInfo, DataPath, Datastore,
    DatastoreFactory, Mutation, Precondition, Snapshot, VersionedNode, WriteTransaction,
};
pub use event_source::{EventKind, EventSource, EventSourceFactory, EventStream, OrchestrationEvent};
