//! Health monitor.
//!
//! Probes resources through the [`ResourceProber`], classifies each result,
//! runs the status state machine and writes status and health fields into
//! the registry. Failures are absorbed here: they become status transitions
//! and alerts, never errors for unrelated callers.
//!
//! Probe results carry a sequence number issued when the probe is
//! dispatched; a result older than the last applied one for the same
//! resource is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use testfarm_events::{
    event_types, AggregateType, EventEnvelope, MaintenanceChangedPayload, ProbeOutcome,
    RecoveryPayload, ResourceKind, ResourceStatus, ResourceStatusChangedPayload, Severity,
};
use testfarm_id::ResourceId;
use testfarm_reconcile::{AttemptBudget, MissCounter, SequenceGuard, DEFAULT_RECOVERY_ATTEMPTS};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::transition::{classify, next_status, TransitionInput};
use crate::alerts::AlertEmitter;
use crate::clock::Clock;
use crate::config::{EngineConfig, HealthThresholds};
use crate::connector::{ConnectorError, PowerSwitch, ProbeResult, ResourceProber};
use crate::error::EngineError;
use crate::model::{HealthRecord, Resource};
use crate::power::{PowerController, PowerResult, PowerTimings};
use crate::registry::Registry;

/// A finished probe, ready to be applied.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub resource_id: ResourceId,
    /// Issued at dispatch; higher is newer.
    pub seq: u64,
    pub observed_at: DateTime<Utc>,
    pub latency: Option<Duration>,
    pub result: Result<ProbeResult, ConnectorError>,
}

/// What one health check did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub resource_id: ResourceId,
    pub outcome: ProbeOutcome,
    pub previous: ResourceStatus,
    pub status: ResourceStatus,
    /// False when a newer probe had already been applied.
    pub applied: bool,
    /// The transition asked for an automatic recovery.
    pub recovery_pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<PowerResult>,
}

struct MonitorState {
    sequence: SequenceGuard<ResourceId>,
    misses: MissCounter<ResourceId>,
    recovery_budget: AttemptBudget<ResourceId>,
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    prober: Arc<dyn ResourceProber>,
    power: PowerController,
    alerts: AlertEmitter,
    clock: Arc<dyn Clock>,
    thresholds: HealthThresholds,
    probe_timeout: Duration,
    power_cycle_delay: Duration,
    next_seq: AtomicU64,
    state: Mutex<MonitorState>,
    status_changes: Arc<Notify>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<Registry>,
        prober: Arc<dyn ResourceProber>,
        switch: Arc<dyn PowerSwitch>,
        alerts: AlertEmitter,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        let power = PowerController::new(
            switch,
            prober.clone(),
            PowerTimings {
                poll_interval: config.power_poll_interval,
                responsive_timeout: config.power_responsive_timeout,
                probe_timeout: config.probe_timeout,
            },
        );

        Self {
            registry,
            prober,
            power,
            alerts,
            clock,
            thresholds: config.thresholds.clone(),
            probe_timeout: config.probe_timeout,
            power_cycle_delay: config.power_cycle_delay,
            next_seq: AtomicU64::new(0),
            state: Mutex::new(MonitorState {
                sequence: SequenceGuard::new(),
                misses: MissCounter::default(),
                recovery_budget: AttemptBudget::new(DEFAULT_RECOVERY_ATTEMPTS, None),
            }),
            status_changes: Arc::new(Notify::new()),
        }
    }

    /// Signalled after every status change, including those made by
    /// recoveries running in their own task. Wakeups coalesce.
    pub fn status_changes(&self) -> Arc<Notify> {
        self.status_changes.clone()
    }

    fn issue_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn resource_missing(id: &ResourceId) -> EngineError {
        EngineError::ResourceNotFound(id.clone())
    }

    /// Probe one resource, bounded by the probe timeout.
    pub async fn probe(&self, id: &ResourceId) -> Result<ProbeReport, EngineError> {
        let resource = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Self::resource_missing(id))?;

        let seq = self.issue_seq();
        let started = Instant::now();
        let result = match tokio::time::timeout(self.probe_timeout, self.prober.probe(&resource)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(self.probe_timeout)),
        };
        let latency = result.is_ok().then(|| started.elapsed());

        if let Err(e) = &result {
            debug!(resource_id = %id, seq, error = %e, "Probe failed");
        }

        Ok(ProbeReport {
            resource_id: id.clone(),
            seq,
            observed_at: self.clock.now(),
            latency,
            result,
        })
    }

    /// Apply a probe result to the registry.
    ///
    /// Stale reports change nothing and come back with `applied == false`.
    #[instrument(skip(self, report), fields(resource_id = %report.resource_id, seq = report.seq))]
    pub async fn apply_probe(&self, report: ProbeReport) -> Result<HealthCheck, EngineError> {
        let id = report.resource_id.clone();
        let mut state = self.state.lock().await;

        let resource = self
            .registry
            .get(&id)
            .await
            .ok_or_else(|| Self::resource_missing(&id))?;
        let classification = classify(resource.kind(), &report.result, &self.thresholds);

        if !state.sequence.admit(id.clone(), report.seq) {
            debug!(
                last_applied = ?state.sequence.last(&id),
                "Discarding stale probe result"
            );
            return Ok(HealthCheck {
                resource_id: id,
                outcome: classification.outcome,
                previous: resource.status,
                status: resource.status,
                applied: false,
                recovery_pending: false,
                recovery: None,
            });
        }

        let misses = if classification.outcome == ProbeOutcome::Unreachable {
            state.misses.miss(id.clone())
        } else {
            state.misses.hit(&id);
            0
        };

        // Status is decided on the live record under the registry write lock;
        // reservations flip boards between AVAILABLE and IN_USE concurrently.
        let outcome = classification.outcome;
        let miss_threshold = self.thresholds.miss_threshold;
        let budget_allows = state.recovery_budget.allows(&id, report.observed_at);
        let metrics = report.result.as_ref().ok().filter(|p| p.reachable).map(|p| p.metrics.clone());
        let (before, transition) = self
            .registry
            .update(&id, |r| {
                let before = r.clone();
                let transition = next_status(TransitionInput {
                    kind: r.kind(),
                    status: r.status,
                    outcome,
                    consecutive_misses: misses,
                    miss_threshold,
                    needs_intervention: r.needs_intervention,
                    recovery_allowed: r.power_control().is_some() && budget_allows,
                    reserved: r.active_reservations > 0,
                });
                r.status = transition.status;
                r.last_health_check = Some(report.observed_at);
                if let Some(metrics) = metrics {
                    r.utilization = metrics;
                }
                (before, transition)
            })
            .await
            .ok_or_else(|| Self::resource_missing(&id))?;

        let detail = classification.reasons.join("; ");
        self.registry
            .append_health(HealthRecord {
                resource_id: id.clone(),
                observed_at: report.observed_at,
                seq: report.seq,
                outcome: classification.outcome,
                latency_ms: report.latency.map(|l| l.as_millis() as u64),
                detail: detail.clone(),
            })
            .await;

        if transition.status != before.status {
            let reason = if detail.is_empty() {
                format!("probe {}", outcome_str(outcome))
            } else {
                detail
            };
            self.status_changed(&before, transition.status, &reason, before.needs_intervention);
        }

        Ok(HealthCheck {
            resource_id: id,
            outcome,
            previous: before.status,
            status: transition.status,
            applied: true,
            recovery_pending: transition.attempt_recovery,
            recovery: None,
        })
    }

    /// Probe and apply one resource; an automatic recovery runs inline.
    pub async fn check_resource(&self, id: &ResourceId) -> Result<HealthCheck, EngineError> {
        let report = self.probe(id).await?;
        let mut check = self.apply_probe(report).await?;

        if check.recovery_pending {
            let result = self.recover(id).await?;
            check.status = self
                .registry
                .get(id)
                .await
                .map(|r| r.status)
                .unwrap_or(check.status);
            check.recovery = Some(result);
        }
        Ok(check)
    }

    /// Probe every resource of `kind` concurrently.
    ///
    /// Recoveries are spawned as separate tasks so one slow power cycle does
    /// not hold up the next round of probes.
    #[instrument(skip(self))]
    pub async fn check_kind(self: &Arc<Self>, kind: ResourceKind) -> Vec<HealthCheck> {
        let ids = self.registry.ids_of(kind).await;

        let reports = join_all(ids.iter().map(|id| self.probe(id))).await;

        let mut checks = Vec::with_capacity(reports.len());
        for report in reports.into_iter().flatten() {
            match self.apply_probe(report).await {
                Ok(check) => {
                    if check.recovery_pending {
                        let monitor = Arc::clone(self);
                        let id = check.resource_id.clone();
                        tokio::spawn(async move {
                            match monitor.recover(&id).await {
                                Ok(_) => {}
                                // Another round already started the cycle.
                                Err(EngineError::InvalidState(reason)) => {
                                    debug!(resource_id = %id, reason = %reason, "Automatic recovery skipped")
                                }
                                Err(e) => error!(resource_id = %id, error = %e, "Automatic recovery aborted"),
                            }
                        });
                    }
                    checks.push(check);
                }
                Err(e) => debug!(error = %e, "Resource vanished before its probe was applied"),
            }
        }

        debug!(kind = %kind, probed = checks.len(), "Health round complete");
        checks
    }

    /// Automatic recovery of an offline board: one power cycle.
    ///
    /// Success puts the board back in its healthy status. Failure leaves it
    /// offline, flags it for manual intervention and spends the recovery
    /// budget, so no further automatic attempt happens until
    /// [`HealthMonitor::clear_intervention`].
    #[instrument(skip(self))]
    pub(crate) async fn recover(&self, id: &ResourceId) -> Result<PowerResult, EngineError> {
        let board = {
            let _state = self.state.lock().await;
            let board = self
                .registry
                .get(id)
                .await
                .ok_or_else(|| Self::resource_missing(id))?;
            if board.power_control().is_none() {
                return Err(EngineError::InvalidState(format!(
                    "{id} has no power control"
                )));
            }
            if board.status != ResourceStatus::Offline || board.needs_intervention {
                return Err(EngineError::InvalidState(format!(
                    "{id} is {} and cannot be recovered automatically",
                    board.status
                )));
            }

            self.set_status(&board, ResourceStatus::Recovery, "automatic power cycle", false)
                .await;
            warn!(resource_id = %id, "Starting automatic recovery");
            self.emit_recovery(id, event_types::RECOVERY_STARTED, Severity::Warning, None, "power cycle started");
            board
        };

        let result = self.power.power_cycle(&board, self.power_cycle_delay).await;

        let mut state = self.state.lock().await;
        // Probes dispatched before the cycle finished describe the old board.
        let seq = self.issue_seq();
        state.sequence.admit(id.clone(), seq);
        let now = self.clock.now();

        let Some(current) = self.registry.get(id).await else {
            return Ok(result);
        };

        if result.success {
            state.recovery_budget.clear(id);
            state.misses.hit(id);
            let healthy = current.healthy_status();
            self.set_status(&current, healthy, "recovered by power cycle", false).await;
            info!(resource_id = %id, elapsed_ms = result.elapsed_ms, "Automatic recovery succeeded");
            self.emit_recovery(id, event_types::RECOVERY_SUCCEEDED, Severity::Info, None, &result.detail);
        } else {
            state.recovery_budget.record_failure(id, now);
            let reason = result
                .failure()
                .map(|f| f.to_string())
                .unwrap_or_else(|| result.detail.clone());
            self.set_status(&current, ResourceStatus::Offline, &reason, true).await;
            error!(
                resource_id = %id,
                failed_step = ?result.failed_step,
                detail = %result.detail,
                "Automatic recovery failed, board needs manual intervention"
            );
            self.emit_recovery(
                id,
                event_types::RECOVERY_FAILED,
                Severity::Critical,
                result.failed_step.map(|s| s.to_string()),
                &result.detail,
            );
        }

        Ok(result)
    }

    /// Manual power cycle. Status is left to the next probe.
    pub async fn power_cycle(&self, id: &ResourceId, delay: Duration) -> Result<PowerResult, EngineError> {
        let board = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Self::resource_missing(id))?;
        if !board.is_board() {
            return Err(EngineError::InvalidState(format!("{id} is not a board")));
        }
        Ok(self.power.power_cycle(&board, delay).await)
    }

    // -------------------------------------------------------------------------
    // Administrative actions
    // -------------------------------------------------------------------------

    /// Toggle the maintenance flag. Status is left alone.
    pub async fn set_maintenance_mode(&self, id: &ResourceId, enabled: bool) -> Result<Resource, EngineError> {
        let _state = self.state.lock().await;
        let updated = self
            .registry
            .update(id, |r| {
                let changed = r.maintenance_mode != enabled;
                r.maintenance_mode = enabled;
                (changed, r.clone())
            })
            .await
            .ok_or_else(|| Self::resource_missing(id))?;

        let (changed, resource) = updated;
        if changed {
            info!(resource_id = %id, maintenance_mode = enabled, "Maintenance mode changed");
            self.alerts.emit(
                EventEnvelope::builder()
                    .aggregate(AggregateType::Resource, id.to_string())
                    .event_type(event_types::RESOURCE_MAINTENANCE_CHANGED)
                    .severity(Severity::Info)
                    .payload(MaintenanceChangedPayload {
                        resource_id: id.clone(),
                        maintenance_mode: enabled,
                    }),
            );
        }
        Ok(resource)
    }

    /// Put a resource in the MAINTENANCE status.
    pub async fn enter_maintenance(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        let _state = self.state.lock().await;
        let resource = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Self::resource_missing(id))?;

        match resource.status {
            ResourceStatus::Maintenance => return Ok(resource),
            ResourceStatus::Flashing | ResourceStatus::Recovery => {
                return Err(EngineError::InvalidState(format!(
                    "{id} is {}, wait for it to finish",
                    resource.status
                )))
            }
            _ => {}
        }

        self.set_status(&resource, ResourceStatus::Maintenance, "operator action", resource.needs_intervention)
            .await;
        self.current(id).await
    }

    /// Leave MAINTENANCE. Only ever happens through this call.
    pub async fn exit_maintenance(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        let mut state = self.state.lock().await;
        let resource = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Self::resource_missing(id))?;
        if resource.status != ResourceStatus::Maintenance {
            return Err(EngineError::InvalidState(format!(
                "{id} is {}, not in maintenance",
                resource.status
            )));
        }

        state.misses.hit(id);
        self.set_status(&resource, resource.healthy_status(), "operator action", resource.needs_intervention)
            .await;
        self.current(id).await
    }

    /// Clear the manual-intervention flag and re-arm automatic recovery.
    ///
    /// An offline resource goes back to UNKNOWN until the next probe.
    pub async fn clear_intervention(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        let mut state = self.state.lock().await;
        let resource = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Self::resource_missing(id))?;

        state.recovery_budget.clear(id);
        state.misses.hit(id);
        self.registry
            .update(id, |r| r.needs_intervention = false)
            .await;

        if resource.status == ResourceStatus::Offline {
            self.set_status(&resource, ResourceStatus::Unknown, "intervention cleared", false)
                .await;
        }

        info!(resource_id = %id, "Manual intervention cleared");
        self.alerts.emit(
            EventEnvelope::builder()
                .aggregate(AggregateType::Resource, id.to_string())
                .event_type(event_types::RESOURCE_INTERVENTION_CLEARED)
                .severity(Severity::Info)
                .payload(RecoveryPayload {
                    resource_id: id.clone(),
                    failed_step: None,
                    detail: "operator cleared the intervention flag".to_string(),
                }),
        );
        self.current(id).await
    }

    /// Recovery failures recorded against `id` since the last clear.
    pub async fn recovery_failures(&self, id: &ResourceId) -> u32 {
        self.state.lock().await.recovery_budget.failures(id)
    }

    // -------------------------------------------------------------------------
    // Flashing
    // -------------------------------------------------------------------------

    /// Move a held board into FLASHING.
    pub(crate) async fn begin_flash(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        let _state = self.state.lock().await;
        let board = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Self::resource_missing(id))?;

        if !board.is_board() {
            return Err(EngineError::InvalidState(format!("{id} is not a board")));
        }
        if !matches!(board.status, ResourceStatus::Available | ResourceStatus::InUse) {
            return Err(EngineError::InvalidState(format!(
                "{id} is {} and cannot be flashed",
                board.status
            )));
        }

        self.set_status(&board, ResourceStatus::Flashing, "firmware flash started", false)
            .await;
        self.current(id).await
    }

    /// Leave FLASHING: healthy on success, OFFLINE on failure.
    pub(crate) async fn finish_flash(&self, id: &ResourceId, error: Option<&str>) -> Result<Resource, EngineError> {
        let mut state = self.state.lock().await;
        // Probes that raced the flash saw a board mid-write.
        let seq = self.issue_seq();
        state.sequence.admit(id.clone(), seq);

        let board = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Self::resource_missing(id))?;
        if board.status != ResourceStatus::Flashing {
            return Ok(board);
        }

        match error {
            None => {
                state.misses.hit(id);
                self.set_status(&board, board.healthy_status(), "firmware flash completed", false)
                    .await;
            }
            Some(error) => {
                self.set_status(&board, ResourceStatus::Offline, &format!("firmware flash failed: {error}"), false)
                    .await;
            }
        }
        self.current(id).await
    }

    /// Drop tracking state for a decommissioned resource.
    pub(crate) async fn forget(&self, id: &ResourceId) {
        let mut state = self.state.lock().await;
        state.sequence.forget(id);
        state.misses.hit(id);
        state.recovery_budget.clear(id);
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn current(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| Self::resource_missing(id))
    }

    /// Write a status (and the intervention flag) and announce it.
    async fn set_status(&self, before: &Resource, status: ResourceStatus, reason: &str, needs_intervention: bool) {
        let applied = self
            .registry
            .update(&before.id, |r| {
                r.status = status;
                r.needs_intervention = needs_intervention;
            })
            .await;
        if applied.is_none() {
            return;
        }
        if before.status != status || before.needs_intervention != needs_intervention {
            self.status_changed(before, status, reason, needs_intervention);
        }
    }

    fn status_changed(&self, before: &Resource, status: ResourceStatus, reason: &str, needs_intervention: bool) {
        self.status_changes.notify_one();

        let severity = if needs_intervention || status == ResourceStatus::Offline {
            Severity::Critical
        } else if status == ResourceStatus::Degraded {
            Severity::Warning
        } else {
            Severity::Info
        };

        match severity {
            Severity::Info => info!(
                resource_id = %before.id,
                from = %before.status,
                to = %status,
                reason,
                "Resource status changed"
            ),
            _ => warn!(
                resource_id = %before.id,
                from = %before.status,
                to = %status,
                reason,
                needs_intervention,
                "Resource status changed"
            ),
        }

        self.alerts.emit(
            EventEnvelope::builder()
                .aggregate(AggregateType::Resource, before.id.to_string())
                .event_type(event_types::RESOURCE_STATUS_CHANGED)
                .severity(severity)
                .payload(ResourceStatusChangedPayload {
                    resource_id: before.id.clone(),
                    kind: before.kind(),
                    old_status: before.status,
                    new_status: status,
                    reason: reason.to_string(),
                    needs_intervention,
                }),
        );
    }

    fn emit_recovery(
        &self,
        id: &ResourceId,
        event_type: &str,
        severity: Severity,
        failed_step: Option<String>,
        detail: &str,
    ) {
        self.alerts.emit(
            EventEnvelope::builder()
                .aggregate(AggregateType::Resource, id.to_string())
                .event_type(event_type)
                .severity(severity)
                .payload(RecoveryPayload {
                    resource_id: id.clone(),
                    failed_step,
                    detail: detail.to_string(),
                }),
        );
    }
}

fn outcome_str(outcome: ProbeOutcome) -> &'static str {
    match outcome {
        ProbeOutcome::Ok => "ok",
        ProbeOutcome::Degraded => "degraded",
        ProbeOutcome::Unreachable => "unreachable",
    }
}
