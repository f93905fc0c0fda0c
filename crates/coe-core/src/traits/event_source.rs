// # Event Source Trait
//
// Defines the interface for the orchestration feed: a lazy, infinite,
// restartable sequence of workload lifecycle events.
//
// ## Implementations
//
// - In-memory: `coe_core::source::MemoryEventSource`
// - Kubernetes API polling: `coe-source-kube` crate
//
// ## Usage
//
// ```rust,ignore
// use coe_core::EventSource;
// use tokio_stream::StreamExt;
//
// // Resume after the last fully processed event
// let mut events = source.subscribe(checkpoint.map(|c| c.seq));
// while let Some(event) = events.next().await {
//     println!("{:?}", event?);
// }
// ```

use crate::model::{EndpointId, WorkloadEndpoint};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

/// Orchestration lifecycle action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// A workload lifecycle event tagged with its feed position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationEvent {
    /// Position in the feed
    pub seq: u64,
    pub kind: EventKind,
    pub endpoint: WorkloadEndpoint,
    /// Highest position a new subscription may start after without missing
    /// this event or any event delivered after it
    ///
    /// `None` means the feed is ordered up to here and `seq` itself is safe.
    /// Feeds that merge several ordered lists set it to the lowest list
    /// position, since a later event may carry a smaller `seq`.
    pub resume_after: Option<u64>,
}

impl OrchestrationEvent {
    pub fn new(seq: u64, kind: EventKind, endpoint: WorkloadEndpoint) -> Self {
        Self {
            seq,
            kind,
            endpoint,
            resume_after: None,
        }
    }

    pub fn with_resume_after(mut self, resume_after: u64) -> Self {
        self.resume_after = Some(resume_after);
        self
    }

    pub fn create(seq: u64, endpoint: WorkloadEndpoint) -> Self {
        Self::new(seq, EventKind::Create, endpoint)
    }

    pub fn update(seq: u64, endpoint: WorkloadEndpoint) -> Self {
        Self::new(seq, EventKind::Update, endpoint)
    }

    pub fn delete(seq: u64, endpoint: WorkloadEndpoint) -> Self {
        Self::new(seq, EventKind::Delete, endpoint)
    }

    pub fn id(&self) -> &EndpointId {
        &self.endpoint.id
    }

    /// Where a subscription can resume once this event is handled
    pub fn resume_point(&self) -> u64 {
        self.resume_after.unwrap_or(self.seq)
    }
}

/// Stream of orchestration events
///
/// An `Err` item reports a broken feed; the northbound provider
/// resubscribes after it.
pub type EventStream =
    Pin<Box<dyn Stream<Item = crate::Result<OrchestrationEvent>> + Send + 'static>>;

/// Trait for orchestration event source implementations
///
/// # Redelivery
///
/// `subscribe(after)` must yield every event with `seq > after`, first the
/// backlog and then live events. Replays are expected; the engine drops
/// events that are not newer than what it already accepted for an identity.
///
/// A feed whose `seq` can go backwards across identities must stamp its
/// events with [`OrchestrationEvent::resume_after`]; the checkpoint never
/// passes the highest resume point seen.
///
/// # Responsibilities
///
/// - Observe the orchestrator, never the datastore
/// - Spawned polling tasks must stop once the stream is dropped
/// - No retry policy beyond the polling cadence; a broken feed is reported
///   as an `Err` item
pub trait EventSource: Send + Sync {
    /// Subscribe to events strictly after `after` (from the start when `None`)
    fn subscribe(&self, after: Option<u64>) -> EventStream;

    /// Source name (for logging)
    fn source_name(&self) -> &'static str;
}

/// Helper trait for constructing event sources from configuration
pub trait EventSourceFactory: Send + Sync {
    fn create(
        &self,
        config: &crate::config::EventSourceConfig,
    ) -> crate::Result<Arc<dyn EventSource>>;
}
