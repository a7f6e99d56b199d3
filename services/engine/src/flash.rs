//! Board firmware flashing.
//!
//! A flash holds the board's exclusive lock for its whole duration: either
//! the caller's own reservation, or an internal one taken here and released
//! when the flash ends. While the connector stream runs the board is
//! FLASHING and cannot be selected.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use testfarm_events::{event_types, AggregateType, EventEnvelope, FlashPayload, Severity};
use testfarm_id::{ReservationId, ResourceId};
use tracing::{debug, error, info, instrument};

use crate::alerts::AlertEmitter;
use crate::clock::{self, Clock};
use crate::connector::{BoardFlasher, FlashProgress};
use crate::error::{ConnectivityError, EngineError};
use crate::health::HealthMonitor;
use crate::model::{Holder, ReservationPurpose, ResourceSlice};
use crate::registry::Registry;
use crate::reservation::ReservationManager;

/// Result of a flash attempt that got as far as the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashReport {
    pub board_id: ResourceId,
    pub firmware_ref: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress: Option<FlashProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct FlashController {
    registry: Arc<Registry>,
    reservations: Arc<ReservationManager>,
    monitor: Arc<HealthMonitor>,
    flasher: Arc<dyn BoardFlasher>,
    alerts: AlertEmitter,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl FlashController {
    pub fn new(
        registry: Arc<Registry>,
        reservations: Arc<ReservationManager>,
        monitor: Arc<HealthMonitor>,
        flasher: Arc<dyn BoardFlasher>,
        alerts: AlertEmitter,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            reservations,
            monitor,
            flasher,
            alerts,
            clock,
            timeout,
        }
    }

    /// Flash `firmware_ref` onto a board.
    ///
    /// With `reservation`, the caller's hold on the board is used (and
    /// stretched to cover the flash timeout). Without one, the board must be
    /// free and is locked for the duration of the flash.
    #[instrument(skip(self, holder), fields(holder = %holder))]
    pub async fn flash_board(
        &self,
        board_id: &ResourceId,
        firmware_ref: &str,
        reservation: Option<ReservationId>,
        holder: &str,
    ) -> Result<FlashReport, EngineError> {
        let board = self
            .registry
            .get(board_id)
            .await
            .ok_or_else(|| EngineError::ResourceNotFound(board_id.clone()))?;
        if !board.is_board() {
            return Err(EngineError::InvalidState(format!("{board_id} is not a board")));
        }

        let internal = match reservation {
            Some(id) => {
                self.check_caller_hold(&id, board_id).await?;
                None
            }
            None => {
                let lock = self
                    .reservations
                    .reserve_for(
                        board_id,
                        ResourceSlice::default(),
                        self.timeout,
                        Holder::new(holder),
                        ReservationPurpose::Flash,
                    )
                    .await
                    .map_err(|denied| EngineError::Capacity(denied.into_capacity_error(Vec::new())))?;
                Some(lock.id)
            }
        };

        let report = self.run_flash(board_id, firmware_ref).await;

        if let Some(lock) = internal {
            self.reservations.release(&lock).await;
        }
        report
    }

    async fn check_caller_hold(&self, id: &ReservationId, board_id: &ResourceId) -> Result<(), EngineError> {
        let held = self
            .reservations
            .get(id)
            .await
            .ok_or(EngineError::ReservationNotFound(*id))?;
        if &held.resource_id != board_id {
            return Err(EngineError::InvalidState(format!(
                "reservation {id} holds {}, not {board_id}",
                held.resource_id
            )));
        }

        let now = self.clock.now();
        if held.is_expired(now) {
            return Err(EngineError::InvalidState(format!(
                "reservation {id} on {board_id} expired at {}",
                held.expires_at
            )));
        }

        if held.expires_at < clock::after(now, self.timeout) {
            self.reservations
                .extend(id, self.timeout)
                .await
                .ok_or(EngineError::ReservationNotFound(*id))?;
        }
        Ok(())
    }

    async fn run_flash(&self, board_id: &ResourceId, firmware_ref: &str) -> Result<FlashReport, EngineError> {
        let board = self.monitor.begin_flash(board_id).await?;

        info!(resource_id = %board_id, firmware_ref, "Flash started");
        self.emit(board_id, firmware_ref, event_types::FLASH_STARTED, Severity::Info, None);

        let mut last_progress = None;
        let outcome = match self.flasher.flash(&board, firmware_ref).await {
            Err(source) => Err(ConnectivityError {
                resource_id: board_id.clone(),
                source,
            }
            .to_string()),
            Ok(mut stream) => {
                let consumed = tokio::time::timeout(self.timeout, async {
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(progress) => {
                                debug!(
                                    resource_id = %board_id,
                                    percent = progress.percent,
                                    phase = %progress.phase,
                                    "Flash progress"
                                );
                                last_progress = Some(progress);
                            }
                            Err(e) => return Err(e.to_string()),
                        }
                    }
                    Ok(())
                })
                .await;

                match consumed {
                    Ok(result) => result,
                    Err(_) => Err(format!("flash did not finish within {}s", self.timeout.as_secs())),
                }
            }
        };

        let error = outcome.err();
        self.monitor.finish_flash(board_id, error.as_deref()).await?;

        match &error {
            None => {
                info!(resource_id = %board_id, firmware_ref, "Flash completed");
                self.emit(board_id, firmware_ref, event_types::FLASH_COMPLETED, Severity::Info, None);
            }
            Some(e) => {
                error!(resource_id = %board_id, firmware_ref, error = %e, "Flash failed");
                self.emit(
                    board_id,
                    firmware_ref,
                    event_types::FLASH_FAILED,
                    Severity::Critical,
                    Some(e.clone()),
                );
            }
        }

        Ok(FlashReport {
            board_id: board_id.clone(),
            firmware_ref: firmware_ref.to_string(),
            success: error.is_none(),
            last_progress,
            error,
        })
    }

    fn emit(
        &self,
        board_id: &ResourceId,
        firmware_ref: &str,
        event_type: &str,
        severity: Severity,
        error: Option<String>,
    ) {
        self.alerts.emit(
            EventEnvelope::builder()
                .aggregate(AggregateType::Resource, board_id.to_string())
                .event_type(event_type)
                .severity(severity)
                .payload(FlashPayload {
                    resource_id: board_id.clone(),
                    firmware_ref: firmware_ref.to_string(),
                    error,
                }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::connector::MockFleet;
    use crate::model::{BoardSpec, Capacity, ConnectionInfo, Resource, ResourceSpec};
    use testfarm_events::ResourceStatus;

    struct Fixture {
        clock: Arc<ManualClock>,
        fleet: Arc<MockFleet>,
        registry: Arc<Registry>,
        reservations: Arc<ReservationManager>,
        flash: FlashController,
    }

    fn b1() -> ResourceId {
        ResourceId::parse("B1").unwrap()
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::fixed());
        let registry = Arc::new(Registry::new(16));
        let alerts = AlertEmitter::new(clock.clone(), 64);
        let fleet = Arc::new(MockFleet::new());

        registry
            .insert(
                Resource::new(
                    b1(),
                    ResourceSpec::Board(BoardSpec {
                        board_type: "stm32mp1".to_string(),
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
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            fleet.clone(),
            fleet.clone(),
            alerts.clone(),
            clock.clone(),
            &EngineConfig::default(),
        ));
        let flash = FlashController::new(
            registry.clone(),
            reservations.clone(),
            monitor,
            fleet.clone(),
            alerts,
            clock.clone(),
            Duration::from_secs(5),
        );

        Fixture {
            clock,
            fleet,
            registry,
            reservations,
            flash,
        }
    }

    #[tokio::test]
    async fn test_flash_without_reservation_locks_and_frees() {
        let f = fixture().await;
        let report = f.flash.flash_board(&b1(), "fw-1.2.bin", None, "deployer").await.unwrap();

        assert!(report.success);
        assert_eq!(report.last_progress.unwrap().percent, 100);
        assert_eq!(f.registry.get(&b1()).await.unwrap().status, ResourceStatus::Available);
        assert!(f.reservations.active_on(&b1()).await.is_empty());
    }

    #[tokio::test]
    async fn test_flash_failure_takes_board_offline() {
        let f = fixture().await;
        f.fleet.fail_flash(&b1(), "verify mismatch");

        let report = f.flash.flash_board(&b1(), "fw-bad.bin", None, "deployer").await.unwrap();

        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("verify mismatch"));
        assert_eq!(report.last_progress.unwrap().phase, "write");
        assert_eq!(f.registry.get(&b1()).await.unwrap().status, ResourceStatus::Offline);
        assert!(f.reservations.active_on(&b1()).await.is_empty());
    }

    #[tokio::test]
    async fn test_flash_under_caller_reservation_keeps_it() {
        let f = fixture().await;
        let held = f
            .reservations
            .reserve(&b1(), ResourceSlice::default(), Duration::from_secs(1), Holder::new("T1"))
            .await
            .unwrap();

        let report = f
            .flash
            .flash_board(&b1(), "fw-1.3.bin", Some(held.id), "T1")
            .await
            .unwrap();
        assert!(report.success);

        let board = f.registry.get(&b1()).await.unwrap();
        assert_eq!(board.status, ResourceStatus::InUse);
        let still_held = f.reservations.get(&held.id).await.unwrap();
        assert!(still_held.expires_at > held.expires_at);
    }

    #[tokio::test]
    async fn test_flash_under_expired_reservation_refused() {
        let f = fixture().await;
        let held = f
            .reservations
            .reserve(&b1(), ResourceSlice::default(), Duration::from_secs(30), Holder::new("T1"))
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(120));

        let err = f
            .flash
            .flash_board(&b1(), "fw-1.3.bin", Some(held.id), "T1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)), "{err}");
        assert!(f.fleet.actions().is_empty());
        assert_eq!(f.registry.get(&b1()).await.unwrap().status, ResourceStatus::InUse);
        assert_eq!(f.reservations.expire_due().await.len(), 1);
    }

    #[tokio::test]
    async fn test_flash_busy_board_without_reservation_denied() {
        let f = fixture().await;
        f.reservations
            .reserve(&b1(), ResourceSlice::default(), Duration::from_secs(60), Holder::new("T1"))
            .await
            .unwrap();

        let err = f.flash.flash_board(&b1(), "fw.bin", None, "other").await.unwrap_err();
        assert!(matches!(err, EngineError::Capacity(_)));
        assert!(f.fleet.actions().is_empty());
    }
}
