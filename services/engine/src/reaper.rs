//! Reservation reaper.
//!
//! Expires reservations whose holders never released them, hands the freed
//! capacity to queued requests, and cross-checks the capacity bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::allocation::Allocator;
use crate::error::EngineError;
use crate::model::Reservation;
use crate::reservation::ReservationManager;

pub struct ReservationReaper {
    reservations: Arc<ReservationManager>,
    allocator: Arc<Allocator>,
    interval: Duration,
}

impl ReservationReaper {
    pub fn new(reservations: Arc<ReservationManager>, allocator: Arc<Allocator>, interval: Duration) -> Self {
        Self {
            reservations,
            allocator,
            interval,
        }
    }

    /// Reap until shutdown. Returns `Err` only when the bookkeeping audit
    /// finds corruption.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reservation reaper"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "Reservation bookkeeping is corrupt, stopping");
                        return Err(e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reservation reaper shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One pass: expire, re-serve the queue, audit.
    ///
    /// The queue is retried every pass, not only after expiries, so capacity
    /// that came back through health checks reaches waiting requests too.
    pub async fn reap_once(&self) -> Result<Vec<Reservation>, EngineError> {
        let expired = self.reservations.expire_due().await;
        if !expired.is_empty() {
            let ids: Vec<_> = expired.iter().map(|r| r.id).collect();
            self.allocator.forget_grants(&ids).await;
        }

        let granted = self.allocator.drain_queue().await;
        if expired.is_empty() && granted.is_empty() {
            debug!("Reaper pass complete, nothing to do");
        } else {
            info!(
                expired = expired.len(),
                granted_from_queue = granted.len(),
                "Reaper pass complete"
            );
        }

        self.reservations.audit().await?;
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertEmitter;
    use crate::allocation::{AllocationOutcome, AllocationRequest, RequestStatus};
    use crate::clock::ManualClock;
    use crate::config::ScoringWeights;
    use crate::model::{BoardSpec, Capacity, ConnectionInfo, Resource, ResourceSpec};
    use crate::policy::Requester;
    use crate::registry::Registry;
    use crate::selection::Requirements;
    use testfarm_events::{event_types, ResourceStatus};
    use testfarm_id::ResourceId;

    #[tokio::test]
    async fn test_expiry_frees_board_for_queued_request() {
        let clock = Arc::new(ManualClock::fixed());
        let registry = Arc::new(Registry::new(16));
        let alerts = AlertEmitter::new(clock.clone(), 64);
        let b1 = ResourceId::parse("B1").unwrap();
        registry
            .insert(
                Resource::new(
                    b1.clone(),
                    ResourceSpec::Board(BoardSpec {
                        board_type: "rpi4".to_string(),
                        ..BoardSpec::default()
                    }),
                    Capacity::default(),
                    ConnectionInfo::new("b1"),
                )
                .with_status(ResourceStatus::Available),
            )
            .await
            .unwrap();

        let reservations = Arc::new(ReservationManager::new(registry.clone(), clock.clone(), alerts.clone()));
        let allocator = Arc::new(Allocator::new(
            registry.clone(),
            reservations.clone(),
            alerts.clone(),
            clock.clone(),
            ScoringWeights::default(),
            Duration::from_secs(60),
        ));
        let reaper = ReservationReaper::new(reservations.clone(), allocator.clone(), Duration::from_secs(15));

        let first = allocator
            .select_and_reserve(AllocationRequest::new(Requester::new("T1"), Requirements::board()))
            .await
            .unwrap();
        assert!(first.reservation().is_some());

        let waiting = AllocationRequest::new(Requester::new("T2"), Requirements::board());
        let waiting_id = waiting.request_id;
        assert!(matches!(
            allocator.select_and_reserve(waiting).await.unwrap(),
            AllocationOutcome::Queued { .. }
        ));

        assert!(reaper.reap_once().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(61));
        let expired = reaper.reap_once().await.unwrap();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].holder.requester, "T1");
        assert_eq!(alerts.recent_of_type(event_types::RESERVATION_EXPIRED).len(), 1);
        let RequestStatus::Granted { reservation } = allocator.request_status(&waiting_id).await else {
            panic!("T2 should have been granted B1");
        };
        assert_eq!(reservation.resource_id, b1);
        assert_eq!(registry.get(&b1).await.unwrap().status, ResourceStatus::InUse);
    }
}
