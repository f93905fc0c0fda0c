// # coe-core
//
// Core library for the COE reconciler: keeps SDN network bindings in the
// controller datastore converged with the workloads the container
// orchestrator reports.
//
// ## Architecture Overview
//
// - **EventSource**: Trait for the orchestration feed (pods, services, nodes)
// - **Datastore**: Trait for the transactional, hierarchical network-state store
// - **CheckpointStore**: Trait for persisting the processed-event watermark
// - **Translator**: Pure mapping from a workload endpoint to binding intents
// - **ReconciliationEngine**: Single-writer dispatch loop owning the mapping table
// - **NorthboundProvider / SouthboundProvider**: Feed the engine from both sides
// - **CoeService**: Start/stop lifecycle and query interface
// - **ComponentRegistry**: Plugin-based registry for backends
//
// ## Data Flow
//
// ```text
// EventSource ──► Northbound ──┐
//                              ▼
//                    ReconciliationEngine ──► Datastore (write transactions)
//                              ▲                  │
// Datastore ───► Southbound ───┘◄── change notifications
// ```

pub mod checkpoint;
pub mod config;
pub mod datastore;
pub mod engine;
pub mod error;
pub mod model;
pub mod provider;
pub mod registry;
pub mod service;
pub mod source;
pub mod table;
pub mod traits;
pub mod translator;

// Re-export core types for convenience
pub use checkpoint::{FileCheckpointStore, MemoryCheckpointStore};
pub use config::{
    CheckpointConfig, CoeConfig, DatastoreConfig, EngineConfig, EventSourceConfig,
    TranslatorConfig,
};
pub use datastore::{InjectedFailure, MemoryDatastore};
pub use engine::{DrainReport, EngineEvent, EngineHandle, EngineMessage, ReconciliationEngine};
pub use error::{Error, Result};
pub use model::{
    BindingIntent, EndpointId, EndpointPhase, NetworkBinding, NetworkType, NodeInfo,
    WorkloadEndpoint, WorkloadKind,
};
pub use provider::{NorthboundProvider, SouthboundProvider};
pub use registry::ComponentRegistry;
pub use service::CoeService;
pub use source::MemoryEventSource;
pub use table::{MappingEntry, MappingState, MappingTable, MappingView};
pub use traits::{CheckpointStore, DataPath, Datastore, EventKind, EventSource, OrchestrationEvent};
pub use translator::{Translation, Translator};
