//! Minimal embedding example for coe-core
//!
//! This example runs the reconciler inside an application with in-memory
//! collaborators and a custom checkpoint store. The service lifecycle is
//! fully managed by the application.

use coe_core::traits::{Checkpoint, CheckpointStore};
use coe_core::{
    CoeConfig, CoeService, EndpointId, EndpointPhase, MemoryCheckpointStore, MemoryDatastore,
    MemoryEventSource, NetworkType, TranslatorConfig, WorkloadEndpoint,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Checkpoint store that reports every save
struct PrintingCheckpointStore {
    inner: MemoryCheckpointStore,
}

#[async_trait::async_trait]
impl CheckpointStore for PrintingCheckpointStore {
    async fn load(&self) -> coe_core::Result<Option<Checkpoint>> {
        self.inner.load().await
    }

    async fn save(&self, seq: u64) -> coe_core::Result<()> {
        println!("[Checkpoint] watermark -> {}", seq);
        self.inner.save(seq).await
    }

    async fn flush(&self) -> coe_core::Result<()> {
        println!("[Checkpoint] flushed");
        self.inner.flush().await
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    println!("=== Embedded coe-core Example ===\n");

    let datastore = MemoryDatastore::new();
    let source = MemoryEventSource::new();
    let checkpoints = PrintingCheckpointStore {
        inner: MemoryCheckpointStore::new(),
    };

    let mut config = CoeConfig::new();
    config.translator = TranslatorConfig {
        network_type: NetworkType::Vxlan,
        segmentation_id: 1000,
        namespace_segments: BTreeMap::from([("payments".to_string(), 2001)]),
        isolate_namespaces: true,
        ..TranslatorConfig::default()
    };

    println!("1. Starting service...");
    let service = CoeService::new(
        Arc::new(datastore.clone()),
        Arc::new(source.clone()),
        Arc::new(checkpoints),
        config,
    );
    service.start().await?;

    let mut events = service
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("engine events already taken"))?;
    let listener = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("[Event] {:?}", event);
        }
    });

    println!("\n2. Scheduling workloads...");
    let web = EndpointId::pod("shop", "web-0");
    let api = EndpointId::pod("payments", "api-0");
    source.create(
        WorkloadEndpoint::active(web.clone())
            .with_ip("10.0.1.10".parse()?)
            .with_mac("0A:58:0A:00:01:0A")
            .with_node("worker-1")
            .with_label("coe.opendaylight.org/policies", "http"),
    );
    source.create(WorkloadEndpoint::active(api.clone()));
    settle().await;

    let binding = service.current_binding(&web)?;
    println!("\n   {} bound: {}", web, serde_json::to_string_pretty(&binding)?);
    let state = service
        .entry(&api)?
        .map_or_else(|| "absent".to_string(), |e| e.state.to_string());
    println!("   {} is {}", api, state);

    println!("\n3. IP assigned to {}...", api);
    source.update(WorkloadEndpoint::active(api.clone()).with_ip("10.0.2.20".parse()?));
    settle().await;
    println!("   segmentation id: {}", service.current_binding(&api)?.segmentation_id);

    println!("\n4. Someone deletes {}'s node behind our back...", web);
    let web_path = web.binding_path(&service.config().engine.bindings_root());
    datastore.remove(web_path.clone())?;
    settle().await;
    println!("   node restored: {}", datastore.get(&web_path).is_some());

    println!("\n5. Terminating {}...", api);
    source.update(
        WorkloadEndpoint::active(api.clone())
            .with_ip("10.0.2.20".parse()?)
            .with_phase(EndpointPhase::Terminating),
    );
    settle().await;
    println!("   bindings left: {}", service.snapshot()?.len());

    println!("\n6. Stopping service...");
    let report = service.stop().await;
    let _ = tokio::time::timeout(Duration::from_millis(100), listener).await;
    println!(
        "   drained {} task(s), discarded {}",
        report.processed, report.discarded
    );

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- Service lifecycle is fully controlled by the application");
    println!("- Queries keep answering after stop");
    println!("- Custom collaborators plug in through the core traits");

    Ok(())
}
