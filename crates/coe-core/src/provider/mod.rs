//! Providers feeding the reconciliation engine
//!
//! - [`NorthboundProvider`]: orchestration event source → engine
//! - [`SouthboundProvider`]: datastore change subscription → engine
//!
//! Both only forward messages into the engine inbox; neither touches the
//! mapping table. Each runs as one spawned task that exits when its
//! shutdown flag is set.

pub mod northbound;
pub mod southbound;

pub use northbound::NorthboundProvider;
pub use southbound::SouthboundProvider;

use tokio::sync::watch;

/// Wait until `shutdown` is set (or its sender is gone)
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender was dropped, which also means stop
    let _ = shutdown.wait_for(|stop| *stop).await;
}
