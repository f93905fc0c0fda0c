//! Lifecycle service
//!
//! [`CoeService`] wires the collaborators, the engine and both providers
//! together behind an explicit `start()` / `stop()` contract and exposes the
//! query interface.
//!
//! ## Start Order
//!
//! 1. Validate configuration (`Error::FatalConfig`)
//! 2. Build the engine and open the datastore subscription
//! 3. Rehydrate the mapping table from the datastore
//! 4. Start the southbound, then the northbound provider
//! 5. Spawn the reconciliation loop
//!
//! ## Stop Order
//!
//! Providers stop forwarding first; the engine then drains what is already
//! queued within the grace period.

use crate::config::CoeConfig;
use crate::engine::{DrainReport, EngineEvent, ReconciliationEngine};
use crate::error::{Error, Result};
use crate::model::{EndpointId, NetworkBinding};
use crate::provider::{NorthboundProvider, SouthboundProvider};
use crate::table::{MappingEntry, MappingView, TableSnapshot};
use crate::traits::{CheckpointStore, Datastore, EventSource};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

struct Running {
    providers_stop: watch::Sender<bool>,
    engine_stop: watch::Sender<bool>,
    providers: Vec<JoinHandle<()>>,
    engine: JoinHandle<DrainReport>,
}

/// COE reconciler service
///
/// # Example
///
/// ```rust,no_run
/// use coe_core::{CoeConfig, CoeService, MemoryCheckpointStore, MemoryDatastore, MemoryEventSource};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> coe_core::Result<()> {
///     let service = CoeService::new(
///         Arc::new(MemoryDatastore::new()),
///         Arc::new(MemoryEventSource::new()),
///         Arc::new(MemoryCheckpointStore::new()),
///         CoeConfig::default(),
///     );
///
///     service.start().await?;
///     // ...
///     let report = service.stop().await;
///     println!("drained {} tasks", report.processed);
///     Ok(())
/// }
/// ```
pub struct CoeService {
    datastore: Arc<dyn Datastore>,
    source: Arc<dyn EventSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: CoeConfig,
    running: Mutex<Option<Running>>,
    events: std::sync::Mutex<Option<mpsc::Receiver<EngineEvent>>>,
    view: std::sync::Mutex<Option<MappingView>>,
}

impl CoeService {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        source: Arc<dyn EventSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: CoeConfig,
    ) -> Self {
        Self {
            datastore,
            source,
            checkpoints,
            config,
            running: Mutex::new(None),
            events: std::sync::Mutex::new(None),
            view: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoeConfig {
        &self.config
    }

    /// Start reconciling
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyStarted` if the service is running
    /// - `Error::FatalConfig` if the configuration is invalid
    /// - datastore or checkpoint errors from rehydration
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        self.config.validate()?;

        let (engine_stop, engine_stop_rx) = watch::channel(false);
        let (providers_stop, providers_stop_rx) = watch::channel(false);

        let (mut engine, handle, events) = ReconciliationEngine::new(
            self.datastore.clone(),
            self.checkpoints.clone(),
            self.config.translator.clone(),
            self.config.engine.clone(),
            engine_stop_rx,
        )?;

        let southbound = SouthboundProvider::new(
            self.datastore.clone(),
            self.config.engine.bindings_root(),
            handle.clone(),
            self.config.engine.resubscribe_delay(),
        );

        let entries = engine.rehydrate().await?;

        let northbound = NorthboundProvider::new(
            self.source.clone(),
            self.checkpoints.clone(),
            handle.clone(),
            self.config.engine.resubscribe_delay(),
        );

        let southbound_task = southbound.start(providers_stop_rx.clone());
        let northbound_task = match northbound.start(providers_stop_rx).await {
            Ok(task) => task,
            Err(e) => {
                let _ = providers_stop.send(true);
                let _ = southbound_task.await;
                return Err(e);
            }
        };

        let engine_task = tokio::spawn(engine.run());

        *self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(events);
        *self
            .view
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle.view().clone());

        *running = Some(Running {
            providers_stop,
            engine_stop,
            providers: vec![southbound_task, northbound_task],
            engine: engine_task,
        });

        info!(
            "COE service started ({} bindings, datastore={}, source={})",
            entries,
            self.datastore.datastore_name(),
            self.source.source_name()
        );
        Ok(())
    }

    /// Stop reconciling
    ///
    /// Idempotent: stopping a stopped service returns an empty report.
    pub async fn stop(&self) -> DrainReport {
        let Some(running) = self.running.lock().await.take() else {
            return DrainReport::default();
        };

        info!("Stopping COE service");
        let _ = running.providers_stop.send(true);
        for provider in running.providers {
            if let Err(e) = provider.await {
                error!("Provider task failed: {}", e);
            }
        }

        let _ = running.engine_stop.send(true);
        match running.engine.await {
            Ok(report) => report,
            Err(e) => {
                error!("Reconciliation loop failed: {}", e);
                DrainReport::default()
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Take the engine event receiver of the current run
    ///
    /// Returns `None` before the first start or when already taken.
    pub fn take_events(&self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Query view of the latest run
    ///
    /// After `stop()` the view keeps showing the table as it was left.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` before the first `start()`.
    pub fn view(&self) -> Result<MappingView> {
        self.view
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::not_found("service has never been started"))
    }

    /// Binding currently realized for `id`
    pub fn current_binding(&self, id: &EndpointId) -> Result<NetworkBinding> {
        self.view()?.current_binding(id)
    }

    pub fn entry(&self, id: &EndpointId) -> Result<Option<MappingEntry>> {
        Ok(self.view()?.entry(id))
    }

    pub fn snapshot(&self) -> Result<TableSnapshot> {
        Ok(self.view()?.snapshot())
    }
}
