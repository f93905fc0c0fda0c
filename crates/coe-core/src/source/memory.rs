// # Memory Event Source
//
// In-process orchestration feed backed by an append-only log.
//
// ## Purpose
//
// Lets tests and embedders drive the engine without an orchestrator.
// `subscribe(after)` replays the log past `after` and then follows live
// appends, exactly like a restartable watch against a real API server.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::EventSourceConfig;
use crate::error::{Error, Result};
use crate::model::WorkloadEndpoint;
use crate::traits::event_source::{
    EventKind, EventSource, EventSourceFactory, EventStream, OrchestrationEvent,
};

const LIVE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum FeedItem {
    Event(OrchestrationEvent),
    Interrupt,
}

#[derive(Debug, Default)]
struct Log {
    events: Vec<OrchestrationEvent>,
    last_seq: u64,
    subscriptions: usize,
}

/// In-memory orchestration feed
///
/// Clones share the same log.
///
/// # Example
///
/// ```rust
/// use coe_core::{EndpointId, MemoryEventSource, WorkloadEndpoint};
///
/// let source = MemoryEventSource::new();
/// let seq = source.create(WorkloadEndpoint::active(EndpointId::pod("a", "w1")));
/// assert_eq!(seq, 1);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryEventSource {
    log: Arc<Mutex<Log>>,
    live: broadcast::Sender<FeedItem>,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            log: Arc::new(Mutex::new(Log::default())),
            live,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event with the next sequence number and return it
    pub fn publish(&self, kind: EventKind, endpoint: WorkloadEndpoint) -> u64 {
        let mut log = self.lock();
        let event = OrchestrationEvent::new(log.last_seq + 1, kind, endpoint);
        let seq = event.seq;
        self.append(&mut log, event);
        seq
    }

    pub fn create(&self, endpoint: WorkloadEndpoint) -> u64 {
        self.publish(EventKind::Create, endpoint)
    }

    pub fn update(&self, endpoint: WorkloadEndpoint) -> u64 {
        self.publish(EventKind::Update, endpoint)
    }

    pub fn delete(&self, endpoint: WorkloadEndpoint) -> u64 {
        self.publish(EventKind::Delete, endpoint)
    }

    /// Append an event carrying its own sequence number
    ///
    /// Used to simulate redelivery and out-of-order arrival.
    pub fn emit(&self, event: OrchestrationEvent) {
        let mut log = self.lock();
        self.append(&mut log, event);
    }

    fn append(&self, log: &mut Log, event: OrchestrationEvent) {
        log.last_seq = log.last_seq.max(event.seq);
        log.events.push(event.clone());
        // No live subscribers is fine
        let _ = self.live.send(FeedItem::Event(event));
    }

    /// Break every live subscription with an error item
    pub fn interrupt(&self) {
        let _ = self.live.send(FeedItem::Interrupt);
    }

    /// Highest sequence number appended so far
    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq
    }

    /// Number of `subscribe` calls so far
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions
    }
}

impl Default for MemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for MemoryEventSource {
    fn subscribe(&self, after: Option<u64>) -> EventStream {
        let is_new = move |event: &OrchestrationEvent| after.map_or(true, |a| event.seq > a);

        // Backlog snapshot and live receiver are taken under the same lock,
        // so nothing falls between them.
        let (backlog, receiver) = {
            let mut log = self.lock();
            log.subscriptions += 1;
            let backlog: Vec<_> = log.events.iter().filter(|e| is_new(e)).cloned().collect();
            (backlog, self.live.subscribe())
        };

        let live = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(FeedItem::Event(event)) if is_new(&event) => Some(Ok(event)),
            Ok(FeedItem::Event(_)) => None,
            Ok(FeedItem::Interrupt) => Some(Err(Error::event_source("feed interrupted"))),
            Err(lagged) => Some(Err(Error::event_source(format!(
                "subscriber lagged: {}",
                lagged
            )))),
        });

        Box::pin(tokio_stream::iter(backlog.into_iter().map(Ok)).chain(live))
    }

    fn source_name(&self) -> &'static str {
        "memory"
    }
}

/// Factory for the `memory` event source type
pub struct MemoryEventSourceFactory;

impl EventSourceFactory for MemoryEventSourceFactory {
    fn create(&self, config: &EventSourceConfig) -> Result<Arc<dyn EventSource>> {
        match config {
            EventSourceConfig::Memory => Ok(Arc::new(MemoryEventSource::new())),
            other => Err(Error::config(format!(
                "memory event source factory cannot build '{}'",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EndpointId;

    fn endpoint(name: &str) -> WorkloadEndpoint {
        WorkloadEndpoint::active(EndpointId::pod("a", name))
    }

    #[tokio::test]
    async fn replays_after_checkpoint_then_follows_live() {
        let source = MemoryEventSource::new();
        source.create(endpoint("w1"));
        source.create(endpoint("w2"));
        source.create(endpoint("w3"));

        let mut events = source.subscribe(Some(1));
        assert_eq!(events.next().await.unwrap().unwrap().seq, 2);
        assert_eq!(events.next().await.unwrap().unwrap().seq, 3);

        source.delete(endpoint("w1"));
        let live = events.next().await.unwrap().unwrap();
        assert_eq!(live.seq, 4);
        assert_eq!(live.kind, EventKind::Delete);
    }

    #[tokio::test]
    async fn emitted_events_keep_their_seq() {
        let source = MemoryEventSource::new();
        source.emit(OrchestrationEvent::delete(9, endpoint("w1")));
        source.emit(OrchestrationEvent::create(3, endpoint("w1")));

        let mut events = source.subscribe(None);
        assert_eq!(events.next().await.unwrap().unwrap().seq, 9);
        assert_eq!(events.next().await.unwrap().unwrap().seq, 3);
        assert_eq!(source.last_seq(), 9);
        assert_eq!(source.publish(EventKind::Update, endpoint("w2")), 10);
    }

    #[tokio::test]
    async fn interrupt_yields_error_item() {
        let source = MemoryEventSource::new();
        let mut events = source.subscribe(None);

        source.interrupt();

        assert!(events.next().await.unwrap().is_err());
        assert_eq!(source.subscription_count(), 1);
    }
}
