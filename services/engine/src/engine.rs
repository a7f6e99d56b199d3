//! The engine facade.
//!
//! [`Engine`] wires the registry, health monitor, reservation manager,
//! allocator, flash controller and pipeline sequencer together and exposes
//! the operations callers (orchestration, dashboard backend, the binary) use.
//! Every component stays reachable on its own for tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use testfarm_events::{
    event_types, AggregateType, EventEnvelope, ResourceKind, ResourceLifecyclePayload, ResourceStatus, Severity,
    StageKind,
};
use testfarm_id::{GroupId, PipelineId, RequestId, ReservationId, ResourceId};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::alerts::{AlertEmitter, EngineEvent};
use crate::allocation::{AllocationOutcome, AllocationRequest, Allocator, RequestStatus};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::connector::{BoardFlasher, PowerSwitch, ResourceProber};
use crate::error::EngineError;
use crate::flash::{FlashController, FlashReport};
use crate::health::{HealthCheck, HealthMonitor, HealthWorker};
use crate::inventory::Inventory;
use crate::model::{
    HealthRecord, HealthTrend, PipelineRun, Reservation, Resource, ResourceGroup, ResourceSlice, Utilization,
};
use crate::pipeline::{PipelineConfig, PipelineSequencer, StageExecutor};
use crate::power::PowerResult;
use crate::queue::QueuedRequest;
use crate::reaper::ReservationReaper;
use crate::registry::Registry;
use crate::reservation::ReservationManager;
use crate::selection::{Requirements, SelectionResult};

/// The connectors the engine drives directly.
///
/// Remote command execution is not here: only stage executors use it.
#[derive(Clone)]
pub struct Connectors {
    pub prober: Arc<dyn ResourceProber>,
    pub power: Arc<dyn PowerSwitch>,
    pub flasher: Arc<dyn BoardFlasher>,
}

impl Connectors {
    /// Use one implementation for every connector.
    pub fn uniform<C>(fleet: Arc<C>) -> Self
    where
        C: ResourceProber + PowerSwitch + BoardFlasher + 'static,
    {
        Self {
            prober: fleet.clone(),
            power: fleet.clone(),
            flasher: fleet,
        }
    }
}

/// Handles of the background workers started by [`Engine::spawn_workers`].
pub struct Workers {
    pub health: Vec<JoinHandle<()>>,
    /// Ends with `Err` only when the reservation audit finds corruption.
    pub reaper: JoinHandle<Result<(), EngineError>>,
}

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    alerts: AlertEmitter,
    registry: Arc<Registry>,
    reservations: Arc<ReservationManager>,
    allocator: Arc<Allocator>,
    monitor: Arc<HealthMonitor>,
    flash: FlashController,
    pipelines: Arc<PipelineSequencer>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        connectors: Connectors,
        executor: Arc<dyn StageExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = config.normalized();
        let alerts = AlertEmitter::new(clock.clone(), config.recent_events_limit);
        let registry = Arc::new(Registry::new(config.health_history_limit));
        let reservations = Arc::new(ReservationManager::new(registry.clone(), clock.clone(), alerts.clone()));
        let allocator = Arc::new(Allocator::new(
            registry.clone(),
            reservations.clone(),
            alerts.clone(),
            clock.clone(),
            config.scoring,
            config.default_reservation_ttl,
        ));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            connectors.prober,
            connectors.power,
            alerts.clone(),
            clock.clone(),
            &config,
        ));
        let flash = FlashController::new(
            registry.clone(),
            reservations.clone(),
            monitor.clone(),
            connectors.flasher,
            alerts.clone(),
            clock.clone(),
            config.flash_timeout,
        );
        let pipelines = Arc::new(PipelineSequencer::new(
            allocator.clone(),
            registry.clone(),
            executor,
            alerts.clone(),
            clock.clone(),
        ));

        Self {
            config,
            clock,
            alerts,
            registry,
            reservations,
            allocator,
            monitor,
            flash,
            pipelines,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn reservations(&self) -> &Arc<ReservationManager> {
        &self.reservations
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    // -------------------------------------------------------------------------
    // Inventory
    // -------------------------------------------------------------------------

    /// Add a resource. Runtime state supplied by the caller is discarded:
    /// the resource starts UNKNOWN (or MAINTENANCE) with nothing allocated.
    #[instrument(skip(self, resource), fields(resource_id = %resource.id, kind = %resource.kind()))]
    pub async fn register(&self, mut resource: Resource) -> Result<Resource, EngineError> {
        if resource.status != ResourceStatus::Maintenance {
            resource.status = ResourceStatus::Unknown;
        }
        resource.needs_intervention = false;
        resource.utilization = Utilization::default();
        resource.last_health_check = None;
        resource.allocated = ResourceSlice::default();
        resource.active_reservations = 0;
        resource.registered_at = Some(self.clock.now());

        self.registry.insert(resource.clone()).await?;

        info!(group_id = ?resource.group_id, "Resource registered");
        self.emit_lifecycle(event_types::RESOURCE_REGISTERED, &resource);
        Ok(resource)
    }

    /// Remove a resource. Refused while anything holds it.
    #[instrument(skip(self))]
    pub async fn decommission(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        let removed = self.reservations.decommission(id).await?;
        self.monitor.forget(id).await;

        info!("Resource decommissioned");
        self.emit_lifecycle(event_types::RESOURCE_DECOMMISSIONED, &removed);
        // Pinned requests waiting for it get redirected.
        self.allocator.drain_queue().await;
        Ok(removed)
    }

    /// Create or replace a group. Returns the previous definition.
    #[instrument(skip(self, group), fields(group_id = %group.id))]
    pub async fn upsert_group(&self, group: ResourceGroup) -> Option<ResourceGroup> {
        let previous = self.registry.upsert_group(group).await;
        info!(replaced = previous.is_some(), "Group saved");
        previous
    }

    /// Move a resource into a group, or out of any group with `None`.
    #[instrument(skip(self))]
    pub async fn assign_group(&self, id: &ResourceId, group_id: Option<GroupId>) -> Result<Resource, EngineError> {
        let resource = self.registry.assign_group(id, group_id).await?;
        info!(group_id = ?resource.group_id, "Resource group assigned");
        self.emit_lifecycle(event_types::RESOURCE_GROUP_ASSIGNED, &resource);
        Ok(resource)
    }

    pub async fn groups(&self) -> Vec<ResourceGroup> {
        self.registry.groups().await
    }

    pub async fn group_members(&self, id: &GroupId) -> Vec<ResourceId> {
        self.registry.group_members(id).await
    }

    /// Load groups, then resources. Stops at the first rejected entry.
    pub async fn seed(&self, inventory: Inventory) -> Result<usize, EngineError> {
        for group in inventory.groups {
            self.upsert_group(group).await;
        }
        let mut registered = 0;
        for resource in inventory.resources {
            self.register(resource).await?;
            registered += 1;
        }
        Ok(registered)
    }

    pub async fn get_resource_status(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| EngineError::ResourceNotFound(id.clone()))
    }

    pub async fn resources(&self) -> Vec<Resource> {
        self.registry.snapshot().await
    }

    pub async fn resources_of(&self, kind: ResourceKind) -> Vec<Resource> {
        self.registry.snapshot_of(kind).await
    }

    // -------------------------------------------------------------------------
    // Selection and reservations
    // -------------------------------------------------------------------------

    /// Pick a resource without reserving it.
    pub async fn select(&self, requirements: &Requirements) -> SelectionResult {
        self.allocator.select(requirements).await
    }

    pub async fn select_and_reserve(&self, request: AllocationRequest) -> Result<AllocationOutcome, EngineError> {
        self.allocator.select_and_reserve(request).await
    }

    /// Release a reservation and serve the queue. Safe to call twice.
    pub async fn release(&self, id: &ReservationId) -> bool {
        self.allocator.release(id).await
    }

    /// Renew a reservation for `ttl` from now.
    pub async fn extend(&self, id: &ReservationId, ttl: Duration) -> Option<Reservation> {
        self.reservations.extend(id, ttl).await
    }

    pub async fn reservation(&self, id: &ReservationId) -> Option<Reservation> {
        self.reservations.get(id).await
    }

    pub async fn active_reservations(&self) -> Vec<Reservation> {
        self.reservations.active().await
    }

    /// Waiting requests in service order.
    pub async fn queued(&self) -> Vec<QueuedRequest> {
        self.allocator.queued().await
    }

    pub async fn withdraw(&self, request_id: &RequestId) -> bool {
        self.allocator.withdraw(request_id).await
    }

    pub async fn poll_request(&self, request_id: &RequestId) -> RequestStatus {
        self.allocator.request_status(request_id).await
    }

    // -------------------------------------------------------------------------
    // Health and recovery
    // -------------------------------------------------------------------------

    pub async fn set_maintenance_mode(&self, id: &ResourceId, enabled: bool) -> Result<Resource, EngineError> {
        let resource = self.monitor.set_maintenance_mode(id, enabled).await?;
        if enabled {
            self.allocator.drain_queue().await;
        } else {
            self.serve_queue().await;
        }
        Ok(resource)
    }

    pub async fn enter_maintenance(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        let resource = self.monitor.enter_maintenance(id).await?;
        self.allocator.drain_queue().await;
        Ok(resource)
    }

    pub async fn exit_maintenance(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        let resource = self.monitor.exit_maintenance(id).await?;
        self.serve_queue().await;
        Ok(resource)
    }

    pub async fn clear_intervention(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        self.monitor.clear_intervention(id).await
    }

    /// Probe one resource now and apply the result.
    pub async fn check_health(&self, id: &ResourceId) -> Result<HealthCheck, EngineError> {
        let check = self.monitor.check_resource(id).await?;
        if check.applied && check.status != check.previous {
            self.serve_queue().await;
        }
        Ok(check)
    }

    /// Probe every resource of every kind once.
    pub async fn check_all(&self) -> Vec<HealthCheck> {
        let mut checks = Vec::new();
        for kind in ResourceKind::ALL {
            checks.extend(self.monitor.check_kind(kind).await);
        }
        self.serve_queue().await;
        checks
    }

    /// Operator-requested power cycle. `None` uses the configured off time.
    pub async fn power_cycle(&self, id: &ResourceId, delay: Option<Duration>) -> Result<PowerResult, EngineError> {
        let delay = delay.unwrap_or(self.config.power_cycle_delay);
        let result = self.monitor.power_cycle(id, delay).await?;
        self.serve_queue().await;
        Ok(result)
    }

    /// Flash a board, inside the caller's reservation when one is given.
    pub async fn flash_board(
        &self,
        id: &ResourceId,
        firmware_ref: &str,
        reservation: Option<ReservationId>,
        holder: &str,
    ) -> Result<FlashReport, EngineError> {
        let report = self.flash.flash_board(id, firmware_ref, reservation, holder).await;
        if reservation.is_none() {
            self.serve_queue().await;
        }
        report
    }

    /// Newest last.
    pub async fn health_history(&self, id: &ResourceId, limit: usize) -> Vec<HealthRecord> {
        self.registry.health_history(id, limit).await
    }

    /// Health summary over the trailing `window`.
    pub async fn health_trend(&self, id: &ResourceId, window: Duration) -> HealthTrend {
        let since = ChronoDuration::from_std(window)
            .ok()
            .and_then(|window| self.clock.now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.registry.health_trend(id, since).await
    }

    pub async fn recovery_failures(&self, id: &ResourceId) -> u32 {
        self.monitor.recovery_failures(id).await
    }

    // -------------------------------------------------------------------------
    // Pipelines
    // -------------------------------------------------------------------------

    pub async fn run_pipeline(&self, config: PipelineConfig) -> Result<PipelineId, EngineError> {
        self.pipelines.run_pipeline(config).await
    }

    pub async fn get_pipeline_status(&self, id: &PipelineId) -> Result<PipelineRun, EngineError> {
        self.pipelines.get(id).await
    }

    pub async fn pipelines(&self) -> Vec<PipelineRun> {
        self.pipelines.list().await
    }

    pub async fn cancel_pipeline(&self, id: &PipelineId) -> Result<PipelineRun, EngineError> {
        self.pipelines.cancel(id).await
    }

    pub async fn retry_stage(&self, id: &PipelineId, stage: StageKind) -> Result<PipelineRun, EngineError> {
        self.pipelines.retry_stage(id, stage).await
    }

    /// Wait until a run is terminal.
    pub async fn wait_for_pipeline(&self, id: &PipelineId) -> Result<PipelineRun, EngineError> {
        self.pipelines.wait(id).await
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.alerts.subscribe()
    }

    /// Most recent events, newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<EngineEvent> {
        self.alerts.recent(limit)
    }

    pub fn recent_events_of_type(&self, event_type: &str) -> Vec<EngineEvent> {
        self.alerts.recent_of_type(event_type)
    }

    /// Cross-check capacity bookkeeping. `Err` is always fatal.
    pub async fn audit(&self) -> Result<(), EngineError> {
        self.reservations.audit().await
    }

    // -------------------------------------------------------------------------
    // Background work
    // -------------------------------------------------------------------------

    /// Start one health worker per resource kind and the reservation reaper.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Workers {
        let health = ResourceKind::ALL
            .into_iter()
            .map(|kind| {
                let worker = HealthWorker::new(
                    self.monitor.clone(),
                    self.allocator.clone(),
                    kind,
                    self.config.probe_interval(kind),
                );
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect();

        let reaper = ReservationReaper::new(
            self.reservations.clone(),
            self.allocator.clone(),
            self.config.reaper_interval,
        );
        let reaper = tokio::spawn(async move { reaper.run(shutdown).await });

        Workers { health, reaper }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn serve_queue(&self) {
        let granted = self.allocator.drain_queue().await;
        if !granted.is_empty() {
            info!(granted = granted.len(), "Queued requests served");
        }
    }

    fn emit_lifecycle(&self, event_type: &str, resource: &Resource) {
        let emitted = self.alerts.emit(
            EventEnvelope::builder()
                .aggregate(AggregateType::Resource, resource.id.to_string())
                .event_type(event_type)
                .severity(Severity::Info)
                .payload(ResourceLifecyclePayload {
                    resource_id: resource.id.clone(),
                    kind: resource.kind(),
                    group_id: resource.group_id.clone(),
                }),
        );
        if emitted.is_none() {
            warn!(event_type, resource_id = %resource.id, "Lifecycle event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connector::MockFleet;
    use crate::model::{AllocationPolicy, BoardSpec, Capacity, ConnectionInfo, ResourceSpec};
    use crate::pipeline::ScriptedExecutor;
    use crate::policy::Requester;

    fn engine() -> (Engine, Arc<MockFleet>, Arc<ManualClock>) {
        let fleet = Arc::new(MockFleet::new());
        let clock = Arc::new(ManualClock::fixed());
        let engine = Engine::new(
            EngineConfig::default(),
            Connectors::uniform(fleet.clone()),
            Arc::new(ScriptedExecutor::new()),
            clock.clone(),
        );
        (engine, fleet, clock)
    }

    fn board(id: &str) -> Resource {
        Resource::new(
            ResourceId::parse(id).unwrap(),
            ResourceSpec::Board(BoardSpec {
                board_type: "rpi4".to_string(),
                ..BoardSpec::default()
            }),
            Capacity::default(),
            ConnectionInfo::new(id.to_lowercase()),
        )
    }

    #[tokio::test]
    async fn test_register_resets_runtime_state() {
        let (engine, _, clock) = engine();
        let mut b1 = board("B1").with_status(ResourceStatus::Available);
        b1.active_reservations = 3;

        let registered = engine.register(b1).await.unwrap();

        assert_eq!(registered.status, ResourceStatus::Unknown);
        assert_eq!(registered.active_reservations, 0);
        assert_eq!(registered.registered_at, Some(clock.now()));
        assert_eq!(engine.recent_events_of_type(event_types::RESOURCE_REGISTERED).len(), 1);
    }

    #[tokio::test]
    async fn test_resources_of_lists_one_kind() {
        let (engine, fleet, _) = engine();
        let b1 = engine.register(board("B1")).await.unwrap().id;
        let b2 = engine.register(board("B2")).await.unwrap().id;
        fleet.set_unreachable(&b2, true);

        engine.check_all().await;

        assert!(engine.resources_of(ResourceKind::Host).await.is_empty());
        let boards = engine.resources_of(ResourceKind::Board).await;
        let healthy: Vec<_> = boards.iter().filter(|r| r.status.is_healthy()).map(|r| r.id.clone()).collect();
        assert_eq!(boards.len(), 2);
        assert_eq!(healthy, vec![b1]);
    }

    #[tokio::test]
    async fn test_register_duplicate_is_conflict() {
        let (engine, _, _) = engine();
        engine.register(board("B1")).await.unwrap();

        let err = engine.register(board("B1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_decommission_refused_while_reserved() {
        let (engine, _, _) = engine();
        let id = engine.register(board("B1")).await.unwrap().id;
        engine.check_health(&id).await.unwrap();

        let outcome = engine
            .select_and_reserve(AllocationRequest::new(Requester::new("T1"), Requirements::board()))
            .await
            .unwrap();
        let reservation = outcome.reservation().cloned().unwrap();

        assert!(matches!(engine.decommission(&id).await, Err(EngineError::Conflict(_))));

        assert!(engine.release(&reservation.id).await);
        engine.decommission(&id).await.unwrap();
        assert!(matches!(
            engine.get_resource_status(&id).await,
            Err(EngineError::ResourceNotFound(_))
        ));
        assert_eq!(engine.recent_events_of_type(event_types::RESOURCE_DECOMMISSIONED).len(), 1);
    }

    #[tokio::test]
    async fn test_assign_group_requires_known_group() {
        let (engine, _, _) = engine();
        let id = engine.register(board("B1")).await.unwrap().id;
        let group = GroupId::parse("kernel-boards").unwrap();

        assert!(matches!(
            engine.assign_group(&id, Some(group.clone())).await,
            Err(EngineError::GroupNotFound(_))
        ));

        engine
            .upsert_group(ResourceGroup::new(group.clone(), AllocationPolicy::default()))
            .await;
        let moved = engine.assign_group(&id, Some(group.clone())).await.unwrap();

        assert_eq!(moved.group_id, Some(group.clone()));
        assert_eq!(engine.group_members(&group).await, vec![id]);
    }

    #[tokio::test]
    async fn test_exit_maintenance_serves_queue() {
        let (engine, _, _) = engine();
        let id = engine.register(board("B1")).await.unwrap().id;
        engine.check_health(&id).await.unwrap();
        engine.enter_maintenance(&id).await.unwrap();

        let request = AllocationRequest::new(Requester::new("T1"), Requirements::board());
        let request_id = request.request_id;
        assert!(matches!(
            engine.select_and_reserve(request).await.unwrap(),
            AllocationOutcome::Queued { .. }
        ));

        engine.exit_maintenance(&id).await.unwrap();

        assert!(matches!(
            engine.poll_request(&request_id).await,
            RequestStatus::Granted { .. }
        ));
        assert_eq!(engine.get_resource_status(&id).await.unwrap().status, ResourceStatus::InUse);
    }

    #[tokio::test]
    async fn test_health_trend_window() {
        let (engine, fleet, clock) = engine();
        let id = engine.register(board("B1")).await.unwrap().id;

        engine.check_health(&id).await.unwrap();
        clock.advance(Duration::from_secs(3600));
        fleet.set_unreachable(&id, true);
        engine.check_health(&id).await.unwrap();

        let recent = engine.health_trend(&id, Duration::from_secs(60)).await;
        assert_eq!(recent.samples, 1);
        assert_eq!(recent.unreachable, 1);

        let all = engine.health_trend(&id, Duration::from_secs(7200)).await;
        assert_eq!(all.samples, 2);
        assert_eq!(engine.health_history(&id, 10).await.len(), 2);
    }
}
