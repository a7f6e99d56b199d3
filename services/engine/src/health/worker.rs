//! Health background worker.
//!
//! One worker per resource kind, each on its own probe interval. Workers
//! also serve the allocation queue whenever the monitor reports a status
//! change, so requests waiting on a resource that came back (or pinned to
//! one that went away) move without waiting for the reaper.

use std::sync::Arc;
use std::time::Duration;

use testfarm_events::{ProbeOutcome, ResourceKind};
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use super::monitor::HealthMonitor;
use crate::allocation::Allocator;

pub struct HealthWorker {
    monitor: Arc<HealthMonitor>,
    allocator: Arc<Allocator>,
    kind: ResourceKind,
    interval: Duration,
}

impl HealthWorker {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        allocator: Arc<Allocator>,
        kind: ResourceKind,
        interval: Duration,
    ) -> Self {
        Self {
            monitor,
            allocator,
            kind,
            interval,
        }
    }

    /// Probe every resource of this kind each interval until shutdown.
    #[instrument(skip(self, shutdown), fields(kind = %self.kind))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting health worker"
        );

        // The first tick fires at once so freshly registered resources leave
        // UNKNOWN without waiting a full interval.
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let status_changes = self.monitor.status_changes();

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_round().await,
                _ = status_changes.notified() => self.serve_queue().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_round(&self) {
        let checks = self.monitor.check_kind(self.kind).await;

        let changed = checks.iter().filter(|c| c.applied && c.previous != c.status).count();
        let unreachable = checks
            .iter()
            .filter(|c| c.outcome == ProbeOutcome::Unreachable)
            .count();

        if changed > 0 {
            info!(
                probed = checks.len(),
                changed,
                unreachable,
                "Health round changed statuses"
            );
        } else {
            debug!(probed = checks.len(), unreachable, "Health round complete");
        }
    }

    async fn serve_queue(&self) {
        let granted = self.allocator.drain_queue().await;
        if !granted.is_empty() {
            info!(granted = granted.len(), "Queued requests served after status change");
        }
    }
}
