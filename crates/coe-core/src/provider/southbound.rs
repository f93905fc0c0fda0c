// # Southbound Provider
//
// Binds datastore change notifications on the bindings subtree to the
// engine.
//
// The subscription is opened in `new`, before the engine reads the subtree
// for rehydration, so no change between that read and `start` is missed.
// An error item (lost notifications) becomes a resync request; an ended
// stream is resubscribed and followed by a resync.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::shutdown_signalled;
use crate::engine::{EngineHandle, EngineMessage};
use crate::traits::{ChangeStream, DataPath, Datastore};

pub struct SouthboundProvider {
    datastore: Arc<dyn Datastore>,
    prefix: DataPath,
    changes: ChangeStream,
    engine: EngineHandle,
    resubscribe_delay: Duration,
}

impl SouthboundProvider {
    /// Subscribe to `prefix` immediately; forwarding begins on `start`
    pub fn new(
        datastore: Arc<dyn Datastore>,
        prefix: DataPath,
        engine: EngineHandle,
        resubscribe_delay: Duration,
    ) -> Self {
        let changes = datastore.subscribe(&prefix);
        Self {
            datastore,
            prefix,
            changes,
            engine,
            resubscribe_delay,
        }
    }

    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            "Southbound provider watching {} on {}",
            self.prefix,
            self.datastore.datastore_name()
        );
        tokio::spawn(self.forward(shutdown))
    }

    async fn forward(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let message = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                item = self.changes.next() => match item {
                    Some(Ok(change)) => EngineMessage::Datastore(change),
                    Some(Err(e)) => {
                        warn!("Datastore notifications lost: {}; requesting resync", e);
                        EngineMessage::Resync
                    }
                    None => {
                        warn!("Datastore subscription ended; resubscribing in {:?}", self.resubscribe_delay);
                        tokio::select! {
                            _ = shutdown_signalled(&mut shutdown) => break,
                            _ = tokio::time::sleep(self.resubscribe_delay) => {}
                        }
                        self.changes = self.datastore.subscribe(&self.prefix);
                        EngineMessage::Resync
                    }
                }
            };

            if self.engine.send(message).await.is_err() {
                debug!("Engine gone, southbound provider exiting");
                break;
            }
        }

        debug!("Southbound provider stopped");
    }
}
