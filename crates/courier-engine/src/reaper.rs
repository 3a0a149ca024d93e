//! Periodic pruning of expired correlation entries

use chrono::Utc;
use courier_core::{StoreError, TaskStore, TaskUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Entries whose newest copy is older than this are dropped
    pub retention: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(2 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tasks_scanned: usize,
    pub tasks_updated: usize,
    pub entries_removed: usize,
    pub failures: usize,
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tasks scanned, {} updated, {} entries removed, {} failures",
            self.tasks_scanned, self.tasks_updated, self.entries_removed, self.failures
        )
    }
}

pub struct CorrelationReaper {
    store: Arc<dyn TaskStore>,
    config: ReaperConfig,
}

impl CorrelationReaper {
    pub fn new(store: Arc<dyn TaskStore>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now().timestamp()).await
    }

    /// Sweep every task as of `now` (epoch seconds)
    pub async fn sweep_at(&self, now: i64) -> SweepReport {
        let retention = i64::try_from(self.config.retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention);
        let mut report = SweepReport::default();

        for mut task in self.store.all_tasks().await {
            report.tasks_scanned += 1;
            let removed = task.correlations.prune_expired(cutoff);
            if removed == 0 {
                continue;
            }

            match self
                .store
                .update(&task.name, TaskUpdate::correlations(task.correlations))
                .await
            {
                Ok(true) => {
                    debug!("Pruned {} expired entries from task {}", removed, task.name);
                    report.tasks_updated += 1;
                    report.entries_removed += removed;
                }
                Ok(false) => debug!("Task {} vanished during sweep", task.name),
                Err(e @ StoreError::Persist { .. }) => {
                    // The mirror holds the pruned map; the next sweep retries the write
                    error!("Correlation sweep of task {}: {}", task.name, e);
                    report.tasks_updated += 1;
                    report.entries_removed += removed;
                    report.failures += 1;
                }
                Err(e) => {
                    error!("Correlation sweep of task {}: {}", task.name, e);
                    report.failures += 1;
                }
            }
        }

        report
    }

    /// Run sweeps on the configured period until cancelled. The first sweep
    /// happens one period after start.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            info!(
                "Correlation reaper started (every {}s, retention {}s)",
                self.config.interval.as_secs(),
                self.config.retention.as_secs()
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Correlation reaper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.sweep().await;
                        if report.entries_removed > 0 || report.failures > 0 {
                            info!("Correlation sweep: {}", report);
                        } else {
                            debug!("Correlation sweep: {}", report);
                        }
                    }
                }
            }
        })
    }
}
