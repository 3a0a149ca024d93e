//! Keeps a running daemon in step with changes made by the admin CLI
//!
//! Tasks and the forwarding identity are edited by a separate `courier`
//! process writing the same database. The refresher re-reads both on a fixed
//! period, or immediately when woken.

use crate::identity::IdentitySelector;
use courier_core::TaskStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct StateRefresher {
    store: Arc<dyn TaskStore>,
    selector: Arc<IdentitySelector>,
    interval: Duration,
}

impl StateRefresher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        selector: Arc<IdentitySelector>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            selector,
            interval,
        }
    }

    /// Create a handle that triggers an immediate refresh when notified
    pub fn create_wake_handle() -> Arc<Notify> {
        Arc::new(Notify::new())
    }

    /// Reload tasks and the forwarding identity once
    pub async fn refresh(&self) {
        match self.store.reload().await {
            Ok(count) => debug!("Reloaded {} task(s)", count),
            Err(e) => error!("Failed to reload tasks: {:#}", e),
        }

        if let Err(e) = self.selector.refresh().await {
            error!("Failed to read forward mode: {:#}", e);
        }
    }

    /// Refresh on the configured period, and whenever `wake` is notified,
    /// until cancelled
    pub fn spawn(self, cancel: CancellationToken, wake: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            info!("State refresher started (every {}s)", self.interval.as_secs());

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("State refresher stopped");
                        break;
                    }
                    _ = interval.tick() => {}
                    _ = wake.notified() => {
                        debug!("State refresh requested");
                    }
                }
                self.refresh().await;
            }
        })
    }
}
