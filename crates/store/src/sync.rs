//! Cross-instance sync: watch durable storage for collection writes made by
//! other running instances and reload when one lands.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::OrderStore;

/// Spawn a polling loop on the current runtime. Storage access runs on the
/// blocking pool. Abort the returned handle to stop it.
pub fn spawn_sync(store: Arc<OrderStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(every_ms = every.as_millis() as u64, "sync listener started");
        loop {
            ticker.tick().await;
            let s = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || s.poll_external()).await {
                Ok(true) => debug!("sync: collection reloaded"),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "sync poll task failed; stopping listener");
                    break;
                }
            }
        }
    })
}
