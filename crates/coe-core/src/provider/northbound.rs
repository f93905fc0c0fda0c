// # Northbound Provider
//
// Binds the orchestration event source to the engine.
//
// ## Behavior
//
// - Subscribes after the stored checkpoint, so a restart replays only the
//   tail the previous run had not finished
// - A broken or ended feed is resubscribed after the highest resume point
//   forwarded so far, with exponential backoff and no attempt limit
// - Stops forwarding as soon as the shutdown flag is set

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::shutdown_signalled;
use crate::engine::{EngineHandle, EngineMessage};
use crate::error::Result;
use crate::traits::{CheckpointStore, EventSource};

/// Cap on the resubscribe backoff, as a multiple of the base delay
const MAX_BACKOFF_FACTOR: u32 = 32;

pub struct NorthboundProvider {
    source: Arc<dyn EventSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    engine: EngineHandle,
    resubscribe_delay: Duration,
}

impl NorthboundProvider {
    pub fn new(
        source: Arc<dyn EventSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        engine: EngineHandle,
        resubscribe_delay: Duration,
    ) -> Self {
        Self {
            source,
            checkpoints,
            engine,
            resubscribe_delay,
        }
    }

    /// Load the checkpoint and spawn the forwarding task
    ///
    /// # Errors
    ///
    /// Fails only if the checkpoint cannot be loaded.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let after = self.checkpoints.load().await?.map(|checkpoint| checkpoint.seq);
        info!(
            "Northbound provider subscribing to {} after {:?}",
            self.source.source_name(),
            after
        );
        Ok(tokio::spawn(self.forward(after, shutdown)))
    }

    async fn forward(self, mut after: Option<u64>, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;

        'subscription: loop {
            let mut events = self.source.subscribe(after);

            loop {
                tokio::select! {
                    _ = shutdown_signalled(&mut shutdown) => break 'subscription,
                    item = events.next() => match item {
                        Some(Ok(event)) => {
                            let resume = event.resume_point();
                            if self.engine.send(EngineMessage::Orchestration(event)).await.is_err() {
                                debug!("Engine gone, northbound provider exiting");
                                break 'subscription;
                            }
                            after = Some(after.map_or(resume, |a| a.max(resume)));
                            failures = 0;
                        }
                        Some(Err(e)) => {
                            warn!("Orchestration feed error: {}", e);
                            break;
                        }
                        None => {
                            warn!("Orchestration feed ended");
                            break;
                        }
                    }
                }
            }

            failures = failures.saturating_add(1);
            let delay = self.resubscribe_delay * failures.min(MAX_BACKOFF_FACTOR).next_power_of_two();
            info!("Resubscribing to {} after {:?} in {:?}", self.source.source_name(), after, delay);

            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break 'subscription,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("Northbound provider stopped");
    }
}
