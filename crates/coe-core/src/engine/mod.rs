//! Reconciliation engine
//!
//! The ReconciliationEngine is responsible for:
//! - Turning orchestration events into per-identity reconciliation tasks
//! - Converging each binding node in the datastore with the translated endpoint
//! - Detecting drift from datastore change notifications and healing it
//! - Advancing the orchestration checkpoint watermark
//!
//! ## Architecture
//!
//! ```text
//!  Northbound ── Orchestration ──┐
//!                                ▼
//!  Southbound ── Datastore ──► inbox ──► TaskQueue ──► execute ──► Datastore
//!                                                         │
//!                                   MappingTable ◄────────┤
//!                                   CheckpointStore ◄─────┘
//! ```
//!
//! ## Task Flow
//!
//! 1. Messages are absorbed from the inbox and folded into the task queue
//! 2. The oldest task is executed: re-read the node, translate, write
//! 3. Retryable failures back off exponentially up to `max_attempts`
//! 4. The table is published and the watermark saved
//!
//! Only this loop mutates the table; everything else talks to it through
//! the inbox.

pub mod queue;

use crate::checkpoint::MemoryCheckpointStore;
use crate::config::{EngineConfig, TranslatorConfig};
use crate::error::{Error, Result};
use crate::model::{EndpointId, NetworkBinding, StoredBinding, WorkloadEndpoint};
use crate::table::{MappingEntry, MappingState, MappingTable, MappingView};
use crate::traits::{
    ChangeKind, ChangeNotification, CheckpointStore, DataPath, Datastore, EventKind,
    OrchestrationEvent, Precondition,
};
use crate::translator::{Translation, Translator};
use queue::{PushOutcome, ReconciliationTask, TaskAction, TaskQueue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Input of the reconciliation loop
#[derive(Debug, Clone)]
pub enum EngineMessage {
    /// Workload lifecycle event from the northbound provider
    Orchestration(OrchestrationEvent),
    /// Binding subtree change from the southbound provider
    Datastore(ChangeNotification),
    /// Change notifications were lost; verify everything
    Resync,
}

/// Events emitted by the ReconciliationEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine started with entries rebuilt from the datastore
    Started { entries: usize },

    /// Entry changed state (`"absent"` once removed)
    StateChanged { id: EndpointId, state: String },

    /// Binding node written (`version` is `None` for deletions)
    Committed { id: EndpointId, version: Option<u64> },

    /// Datastore already matched; no write issued
    Unchanged { id: EndpointId },

    /// Endpoint not ready to be bound
    Deferred { id: EndpointId, missing: String },

    /// Endpoint could not be translated
    Quarantined { id: EndpointId, reason: String },

    /// Write retries exhausted
    TaskFailed {
        id: EndpointId,
        error: String,
        attempts: u32,
    },

    /// Datastore content diverged from the table
    DriftDetected { id: EndpointId },

    /// Binding node without an owning entry was removed
    OrphanRemoved { id: EndpointId },

    /// Orchestration event not newer than the last accepted one
    StaleDropped { id: EndpointId, seq: u64 },

    /// Task left unfinished at shutdown
    TaskDiscarded { id: EndpointId, action: &'static str },

    /// Engine stopped
    Stopped { processed: usize, discarded: usize },
}

/// Outcome of the shutdown drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks completed after shutdown was requested
    pub processed: usize,
    /// Tasks dropped when the grace period ran out
    pub discarded: usize,
}

/// Producer-side handle: inbox sender plus the query view
#[derive(Debug, Clone)]
pub struct EngineHandle {
    inbox: mpsc::Sender<EngineMessage>,
    view: MappingView,
}

impl EngineHandle {
    /// Queue a message for the loop, waiting while the inbox is full
    pub async fn send(&self, message: EngineMessage) -> Result<()> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| Error::Other("reconciliation engine is not running".to_string()))
    }

    pub fn view(&self) -> &MappingView {
        &self.view
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Done,
    /// Backoff would overrun the drain deadline
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Convergence {
    /// Node already matched (`Some(version)` if present)
    Unchanged(Option<u64>),
    /// Node written (`Some(version)`) or deleted (`None`)
    Written(Option<u64>),
}

#[derive(Debug)]
enum ConvergeError {
    Failed { error: Error, attempts: u32 },
    Interrupted,
}

/// Core reconciliation engine
///
/// ## Lifecycle
///
/// 1. Create with [`ReconciliationEngine::new()`]
/// 2. Rebuild the table with [`ReconciliationEngine::rehydrate()`]
/// 3. Run with [`ReconciliationEngine::run()`] until the shutdown flag is set
/// 4. `run` drains within the grace period and returns a [`DrainReport`]
pub struct ReconciliationEngine {
    datastore: Arc<dyn Datastore>,
    checkpoints: Arc<dyn CheckpointStore>,
    translator: Translator,
    config: EngineConfig,
    root: DataPath,
    table: MappingTable,
    queue: TaskQueue,
    inbox: mpsc::Receiver<EngineMessage>,
    event_tx: mpsc::Sender<EngineEvent>,
    saved_watermark: Option<u64>,
    shutdown: watch::Receiver<bool>,
    drain_deadline: Option<Instant>,
}

impl ReconciliationEngine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// The engine, a handle for producers and queries, and the engine
    /// event receiver. The loop stops once `shutdown` turns `true` (or its
    /// sender is dropped).
    pub fn new(
        datastore: Arc<dyn Datastore>,
        checkpoints: Arc<dyn CheckpointStore>,
        translator: TranslatorConfig,
        config: EngineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, EngineHandle, mpsc::Receiver<EngineEvent>)> {
        translator.validate()?;
        config.validate()?;

        let (inbox_tx, inbox) = mpsc::channel(config.inbox_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let table = MappingTable::new();

        let handle = EngineHandle {
            inbox: inbox_tx,
            view: table.view(),
        };

        let engine = Self {
            datastore,
            checkpoints,
            translator: Translator::new(translator),
            root: config.bindings_root(),
            config,
            table,
            queue: TaskQueue::new(),
            inbox,
            event_tx,
            saved_watermark: None,
            shutdown,
            drain_deadline: None,
        };

        Ok((engine, handle, event_rx))
    }

    /// Engine over in-memory checkpoints with default settings (tests, demos)
    pub fn with_datastore(
        datastore: Arc<dyn Datastore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, EngineHandle, mpsc::Receiver<EngineEvent>)> {
        Self::new(
            datastore,
            Arc::new(MemoryCheckpointStore::new()),
            TranslatorConfig::default(),
            EngineConfig::default(),
            shutdown,
        )
    }

    /// Rebuild the mapping table from the bindings subtree
    ///
    /// Every readable node becomes a `Bound` entry. Nodes under a binding
    /// path that do not parse are scheduled for orphan cleanup.
    ///
    /// # Returns
    ///
    /// The number of entries rebuilt.
    pub async fn rehydrate(&mut self) -> Result<usize> {
        let snapshot = self.datastore.read_transaction(&self.root).await?;

        for (path, node) in snapshot.iter() {
            let Some(id) = EndpointId::from_binding_path(&self.root, path) else {
                debug!("Ignoring foreign node {} under bindings root", path);
                continue;
            };

            match StoredBinding::from_value(&node.value) {
                Ok(stored) if stored.endpoint.id == id && stored.binding.endpoint == id => {
                    let mut entry = MappingEntry::new(stored.endpoint, MappingState::Bound);
                    entry.binding = Some(stored.binding);
                    entry.version = Some(node.version);
                    self.table.insert(entry);
                }
                Ok(_) => {
                    warn!("Binding node {} belongs to another identity, scheduling cleanup", path);
                    self.queue.push(ReconciliationTask::verify(id));
                }
                Err(e) => {
                    warn!("Unreadable binding node {}: {}, scheduling cleanup", path, e);
                    self.queue.push(ReconciliationTask::verify(id));
                }
            }
        }

        self.table.publish();
        info!(
            "Rehydrated {} bindings from {} ({})",
            self.table.len(),
            self.root,
            self.datastore.datastore_name()
        );
        Ok(self.table.len())
    }

    /// Run the reconciliation loop until shutdown, then drain
    pub async fn run(mut self) -> DrainReport {
        self.emit_event(EngineEvent::Started {
            entries: self.table.len(),
        });
        self.table.publish();

        let mut interrupted = None;

        loop {
            self.absorb_inbox().await;

            if self.shutdown_requested() {
                break;
            }

            if let Some(task) = self.queue.pop() {
                match self.execute(task.clone()).await {
                    TaskOutcome::Done => self.finish_task().await,
                    TaskOutcome::Interrupted => {
                        interrupted = Some(task);
                        break;
                    }
                }
                continue;
            }

            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        debug!("Engine inbox closed");
                        break;
                    }
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.drain(interrupted).await
    }

    async fn drain(&mut self, interrupted: Option<ReconciliationTask>) -> DrainReport {
        let deadline = *self
            .drain_deadline
            .get_or_insert_with(|| Instant::now() + self.config.shutdown_grace());
        info!("Draining {} queued tasks", self.queue.len());

        self.absorb_inbox().await;

        let mut report = DrainReport::default();
        let mut leftover: Vec<ReconciliationTask> = interrupted.into_iter().collect();

        if leftover.is_empty() {
            while let Some(task) = self.queue.pop() {
                if Instant::now() >= deadline {
                    leftover.push(task);
                    break;
                }
                match self.execute(task.clone()).await {
                    TaskOutcome::Done => {
                        self.finish_task().await;
                        report.processed += 1;
                    }
                    TaskOutcome::Interrupted => {
                        leftover.push(task);
                        break;
                    }
                }
            }
        }

        // Unfinished tasks still hold the watermark back
        let watermark = self.queue.watermark();
        leftover.extend(self.queue.drain());

        for task in &leftover {
            warn!(
                "Discarding unfinished {} task for {} (seq {:?})",
                task.action.name(),
                task.id,
                task.seq
            );
            self.emit_event(EngineEvent::TaskDiscarded {
                id: task.id.clone(),
                action: task.action.name(),
            });
        }
        report.discarded = leftover.len();

        self.save_watermark(watermark).await;
        if let Err(e) = self.checkpoints.flush().await {
            error!("Failed to flush checkpoint: {}", e);
        }
        self.table.publish();

        info!(
            "Engine stopped: {} tasks drained, {} discarded",
            report.processed, report.discarded
        );
        self.emit_event(EngineEvent::Stopped {
            processed: report.processed,
            discarded: report.discarded,
        });
        report
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    async fn absorb_inbox(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            self.handle_message(message).await;
        }
    }

    async fn finish_task(&mut self) {
        self.queue.finish();
        self.table.publish();
        let watermark = self.queue.watermark();
        self.save_watermark(watermark).await;
    }

    async fn save_watermark(&mut self, watermark: Option<u64>) {
        let Some(seq) = watermark else { return };
        if self.saved_watermark.is_some_and(|saved| saved >= seq) {
            return;
        }

        match self.checkpoints.save(seq).await {
            Ok(()) => self.saved_watermark = Some(seq),
            Err(e) => warn!("Failed to save checkpoint {}: {}", seq, e),
        }
    }

    async fn handle_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Orchestration(event) => self.handle_orchestration(event),
            EngineMessage::Datastore(change) => self.handle_change(change),
            EngineMessage::Resync => self.resync().await,
        }
    }

    fn handle_orchestration(&mut self, event: OrchestrationEvent) {
        let id = event.id().clone();
        let resume_point = event.resume_point();
        let action = match event.kind {
            EventKind::Create => TaskAction::Create(event.endpoint),
            EventKind::Update => TaskAction::Update(event.endpoint),
            EventKind::Delete => TaskAction::Delete,
        };
        debug!("{} event for {} (seq {})", action.name(), id, event.seq);

        self.queue.observe_resume_point(resume_point);
        let outcome = self.queue.push(ReconciliationTask {
            id: id.clone(),
            action,
            seq: Some(event.seq),
        });

        if let PushOutcome::Stale { last_accepted } = outcome {
            debug!(
                "Dropping stale event seq {} for {} (already accepted {})",
                event.seq, id, last_accepted
            );
            self.emit_event(EngineEvent::StaleDropped { id, seq: event.seq });
        }
    }

    fn handle_change(&mut self, change: ChangeNotification) {
        let Some(id) = EndpointId::from_binding_path(&self.root, &change.path) else {
            debug!("Ignoring change on non-binding path {}", change.path);
            return;
        };

        let Some(entry) = self.table.get_mut(&id) else {
            if change.kind != ChangeKind::Removed {
                info!("Orphan binding node {} observed, scheduling cleanup", change.path);
                self.queue.push(ReconciliationTask::verify(id));
            }
            return;
        };

        if entry.version.is_some_and(|v| change.version < v) {
            debug!("Ignoring outdated change {} on {}", change.version, change.path);
            return;
        }

        if entry.state.is_parked() {
            debug!("{} is {}, ignoring datastore change", id, entry.state.name());
            return;
        }

        let observed = change
            .value
            .as_ref()
            .and_then(|value| StoredBinding::from_value(value).ok());

        let matches = match (&observed, &entry.binding, &entry.state) {
            (Some(stored), Some(expected), MappingState::Bound | MappingState::Stale) => {
                &stored.binding == expected && stored.endpoint == entry.endpoint
            }
            (None, None, _) => true,
            _ => false,
        };

        if matches {
            if entry.version.is_none_or(|v| change.version > v) && change.value.is_some() {
                entry.version = Some(change.version);
            }
            return;
        }

        info!("Drift detected on {} ({:?})", id, change.kind);
        let was_bound = entry.state == MappingState::Bound;
        if was_bound {
            entry.set_state(MappingState::Stale);
        }

        self.emit_event(EngineEvent::DriftDetected { id: id.clone() });
        if was_bound {
            self.emit_event(EngineEvent::StateChanged {
                id: id.clone(),
                state: MappingState::Stale.name().to_string(),
            });
            self.table.publish();
        }
        self.queue.push(ReconciliationTask::verify(id));
    }

    async fn resync(&mut self) {
        info!("Resynchronizing all bindings");
        let mut ids = self.table.ids();

        match self.datastore.read_transaction(&self.root).await {
            Ok(snapshot) => ids.extend(
                snapshot
                    .iter()
                    .filter_map(|(path, _)| EndpointId::from_binding_path(&self.root, path)),
            ),
            Err(e) => warn!("Resync could not list bindings, verifying known entries only: {}", e),
        }

        ids.sort();
        ids.dedup();
        for id in ids {
            self.queue.push(ReconciliationTask::verify(id));
        }
    }

    async fn execute(&mut self, task: ReconciliationTask) -> TaskOutcome {
        debug!("Executing {} for {}", task.action.name(), task.id);
        match task.action {
            TaskAction::Create(endpoint) | TaskAction::Update(endpoint) => {
                if endpoint.id != task.id {
                    error!("Task for {} carries endpoint {}", task.id, endpoint.id);
                    return TaskOutcome::Done;
                }
                self.apply_endpoint(endpoint, task.seq).await
            }
            TaskAction::Delete => self.remove_endpoint(&task.id).await,
            TaskAction::Verify => self.verify(&task.id).await,
        }
    }

    /// Converge one endpoint to its translated binding
    async fn apply_endpoint(&mut self, endpoint: WorkloadEndpoint, seq: Option<u64>) -> TaskOutcome {
        let id = endpoint.id.clone();

        if endpoint.phase.is_terminal() {
            debug!("{} is {:?}, removing binding", id, endpoint.phase);
            return self.remove_endpoint(&id).await;
        }

        let mut entry = match self.table.get(&id) {
            Some(entry) => entry.clone(),
            None => {
                let entry = MappingEntry::new(
                    endpoint.clone(),
                    MappingState::Pending {
                        reason: "first observation".to_string(),
                    },
                );
                self.emit_event(EngineEvent::StateChanged {
                    id: id.clone(),
                    state: entry.state.name().to_string(),
                });
                entry
            }
        };
        entry.endpoint = endpoint;
        if seq.is_some() {
            entry.last_seq = seq;
        }

        let intents = match self.translator.translate(&entry.endpoint) {
            Ok(Translation::Ready(intents)) => intents,
            Ok(Translation::Deferred { missing }) => return self.defer(entry, missing).await,
            Err(e) => return self.quarantine(entry, e),
        };
        let binding = match NetworkBinding::from_intents(&id, &intents) {
            Ok(binding) => binding,
            Err(e) => return self.quarantine(entry, e),
        };

        let path = id.binding_path(&self.root);

        if entry.state == MappingState::Bound && entry.binding.as_ref() != Some(&binding) {
            self.transition(&mut entry, MappingState::Stale);
        }

        let stored = StoredBinding {
            endpoint: entry.endpoint.clone(),
            binding: binding.clone(),
        };
        let value = match stored.to_value() {
            Ok(value) => value,
            Err(e) => return self.quarantine(entry, e),
        };

        match self.converge(&path, Some(value)).await {
            Ok(convergence) => {
                self.record_commit(&id, convergence);
                entry.binding = Some(binding);
                entry.version = match convergence {
                    Convergence::Unchanged(version) | Convergence::Written(version) => version,
                };
                self.transition(&mut entry, MappingState::Bound);
                self.table.insert(entry);
                TaskOutcome::Done
            }
            Err(e) => self.park_failure(entry, e),
        }
    }

    /// Park an untranslatable endpoint until its next update
    fn quarantine(&mut self, mut entry: MappingEntry, error: Error) -> TaskOutcome {
        let id = entry.id().clone();
        warn!("Quarantining {}: {}", id, error);
        let reason = error.to_string();
        self.transition(
            &mut entry,
            MappingState::Quarantined {
                reason: reason.clone(),
            },
        );
        self.table.insert(entry);
        self.emit_event(EngineEvent::Quarantined { id, reason });
        TaskOutcome::Done
    }

    /// Keep a not-yet-bindable endpoint pending; it must not keep a binding
    async fn defer(&mut self, mut entry: MappingEntry, missing: String) -> TaskOutcome {
        let id = entry.id().clone();
        debug!("{} deferred: missing {}", id, missing);
        self.emit_event(EngineEvent::Deferred {
            id: id.clone(),
            missing: missing.clone(),
        });

        let path = id.binding_path(&self.root);
        match self.converge(&path, None).await {
            Ok(convergence) => {
                self.record_commit(&id, convergence);
                entry.binding = None;
                entry.version = None;
                self.transition(&mut entry, MappingState::Pending { reason: missing });
                self.table.insert(entry);
                TaskOutcome::Done
            }
            Err(e) => self.park_failure(entry, e),
        }
    }

    /// Remove the binding of `id` and forget the entry
    async fn remove_endpoint(&mut self, id: &EndpointId) -> TaskOutcome {
        let path = id.binding_path(&self.root);

        match self.converge(&path, None).await {
            Ok(convergence) => {
                self.record_commit(id, convergence);
                if self.table.remove(id).is_some() {
                    info!("Removed mapping for {}", id);
                    self.emit_event(EngineEvent::StateChanged {
                        id: id.clone(),
                        state: "absent".to_string(),
                    });
                } else {
                    debug!("Delete for unknown {} is a no-op", id);
                }
                TaskOutcome::Done
            }
            Err(ConvergeError::Interrupted) => TaskOutcome::Interrupted,
            Err(ConvergeError::Failed { error, attempts }) => match self.table.get(id).cloned() {
                Some(entry) => self.park_failure(entry, ConvergeError::Failed { error, attempts }),
                None => {
                    error!("Failed to remove orphan {} after {} attempts: {}", id, attempts, error);
                    self.emit_event(EngineEvent::TaskFailed {
                        id: id.clone(),
                        error: error.to_string(),
                        attempts,
                    });
                    TaskOutcome::Done
                }
            },
        }
    }

    /// Re-check one identity against the datastore
    async fn verify(&mut self, id: &EndpointId) -> TaskOutcome {
        let Some(entry) = self.table.get(id) else {
            let path = id.binding_path(&self.root);
            return match self.converge(&path, None).await {
                Ok(Convergence::Written(_)) => {
                    info!("Removed orphan binding {}", path);
                    self.emit_event(EngineEvent::OrphanRemoved { id: id.clone() });
                    TaskOutcome::Done
                }
                Ok(Convergence::Unchanged(_)) => TaskOutcome::Done,
                Err(ConvergeError::Interrupted) => TaskOutcome::Interrupted,
                Err(ConvergeError::Failed { error, attempts }) => {
                    error!("Failed to remove orphan {} after {} attempts: {}", path, attempts, error);
                    self.emit_event(EngineEvent::TaskFailed {
                        id: id.clone(),
                        error: error.to_string(),
                        attempts,
                    });
                    TaskOutcome::Done
                }
            };
        };

        if entry.state.is_parked() {
            debug!("Skipping verify for {} ({})", id, entry.state);
            return TaskOutcome::Done;
        }

        let endpoint = entry.endpoint.clone();
        self.apply_endpoint(endpoint, None).await
    }

    /// Make the node at `path` equal `desired` (`None` = absent)
    ///
    /// Re-reads the node before every attempt, so a retry after a conflict
    /// works against the winner's version. Commits are never cancelled;
    /// only the backoff sleeps between them are.
    async fn converge(
        &mut self,
        path: &DataPath,
        desired: Option<Value>,
    ) -> std::result::Result<Convergence, ConvergeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.converge_once(path, desired.as_ref()).await {
                Ok(convergence) => return Ok(convergence),
                Err(error) if error.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        "Attempt {} on {} failed: {}; retrying in {:?}",
                        attempt, path, error, delay
                    );
                    if !self.backoff_sleep(delay).await {
                        return Err(ConvergeError::Interrupted);
                    }
                }
                Err(error) => {
                    return Err(ConvergeError::Failed {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    async fn converge_once(&self, path: &DataPath, desired: Option<&Value>) -> Result<Convergence> {
        let snapshot = self.datastore.read_transaction(path).await?;
        let current = snapshot.get(path);

        let mut tx = self.datastore.write_transaction();
        match (desired, current) {
            (Some(value), Some(node)) if &node.value == value => {
                return Ok(Convergence::Unchanged(Some(node.version)));
            }
            (None, None) => return Ok(Convergence::Unchanged(None)),
            (Some(value), existing) => {
                let precondition = existing.map_or(Precondition::Absent, |node| {
                    Precondition::Version(node.version)
                });
                tx.put(path.clone(), value.clone(), precondition);
            }
            (None, Some(node)) => {
                tx.delete(path.clone(), Precondition::Version(node.version));
            }
        }

        let info = self.datastore.commit(tx).await?;
        Ok(Convergence::Written(info.version_of(path)))
    }

    /// Sleep before a retry
    ///
    /// Returns `false` when the sleep would end past the drain deadline.
    async fn backoff_sleep(&mut self, delay: Duration) -> bool {
        let wake = Instant::now() + delay;

        if self.drain_deadline.is_none() {
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => return true,
                _ = self.shutdown.changed() => {
                    self.drain_deadline = Some(Instant::now() + self.config.shutdown_grace());
                }
            }
        }

        match self.drain_deadline {
            Some(deadline) if wake > deadline => false,
            _ => {
                tokio::time::sleep_until(wake).await;
                true
            }
        }
    }

    fn park_failure(&mut self, mut entry: MappingEntry, failure: ConvergeError) -> TaskOutcome {
        match failure {
            ConvergeError::Interrupted => {
                self.table.insert(entry);
                TaskOutcome::Interrupted
            }
            ConvergeError::Failed { error, attempts } => {
                let id = entry.id().clone();
                error!("Giving up on {} after {} attempts: {}", id, attempts, error);
                let reason = error.to_string();
                self.transition(
                    &mut entry,
                    MappingState::Error {
                        reason: reason.clone(),
                        attempts,
                    },
                );
                self.table.insert(entry);
                self.emit_event(EngineEvent::TaskFailed {
                    id,
                    error: reason,
                    attempts,
                });
                TaskOutcome::Done
            }
        }
    }

    fn record_commit(&self, id: &EndpointId, convergence: Convergence) {
        match convergence {
            Convergence::Written(version) => {
                debug!("Committed {} (version {:?})", id, version);
                self.emit_event(EngineEvent::Committed {
                    id: id.clone(),
                    version,
                });
            }
            Convergence::Unchanged(_) => {
                debug!("{} already converged, skipping write", id);
                self.emit_event(EngineEvent::Unchanged { id: id.clone() });
            }
        }
    }

    fn transition(&self, entry: &mut MappingEntry, state: MappingState) {
        if entry.state == state {
            return;
        }
        debug!("{}: {} -> {}", entry.id(), entry.state, state);
        self.emit_event(EngineEvent::StateChanged {
            id: entry.id().clone(),
            state: state.name().to_string(),
        });
        entry.set_state(state);
    }

    /// Emit an engine event
    fn emit_event(&self, event: EngineEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            // Nobody listens
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::model::EndpointId;

    #[tokio::test]
    async fn rehydrate_rebuilds_bound_entries_and_flags_garbage() {
        let datastore = MemoryDatastore::new();
        let id = EndpointId::pod("a", "w1");
        let endpoint = WorkloadEndpoint::active(id.clone()).with_ip("10.0.0.5".parse().unwrap());
        let binding = Translator::default().binding_for(&endpoint).unwrap().unwrap();
        let root = DataPath::new("coe/bindings");

        datastore
            .put(
                id.binding_path(&root),
                StoredBinding { endpoint, binding }.to_value().unwrap(),
            )
            .unwrap();
        datastore
            .put("coe/bindings/pod/a/garbage", serde_json::json!({"x": 1}))
            .unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mut engine, handle, _events) =
            ReconciliationEngine::with_datastore(Arc::new(datastore), shutdown_rx).unwrap();

        assert_eq!(engine.rehydrate().await.unwrap(), 1);
        assert_eq!(handle.view().entry(&id).unwrap().state, MappingState::Bound);
        assert!(engine.queue.pending(&EndpointId::pod("a", "garbage")).is_some());
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let (_tx, rx) = watch::channel(false);
        let config = EngineConfig {
            max_attempts: 0,
            ..EngineConfig::default()
        };

        let result = ReconciliationEngine::new(
            Arc::new(MemoryDatastore::new()),
            Arc::new(MemoryCheckpointStore::new()),
            TranslatorConfig::default(),
            config,
            rx,
        );
        assert!(matches!(result, Err(Error::FatalConfig(_))));
    }
}
