//! Pipeline sequencer.
//!
//! Each run is driven by its own task. Stages run strictly in order:
//!
//! - `build` holds a build server only for the build itself
//! - `deploy` picks a host or board and keeps it through `boot` and `test`
//! - a resource-specific deploy failure gets exactly one more try on a
//!   different resource before the run fails
//!
//! Every reservation a run takes is recorded on the run the moment it is
//! granted. Failure, completion and cancellation release all of them, and a
//! grant that lands after the run went terminal is released on the spot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use testfarm_events::{
    event_types, AggregateType, EventEnvelope, PipelinePayload, PipelineStatus, ResourceKind,
    Severity, StageKind, StageStatus,
};
use testfarm_id::{PipelineId, RequestId, ResourceId};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::executor::{StageContext, StageExecutor, StageFailure};
use crate::alerts::AlertEmitter;
use crate::allocation::{AllocationOutcome, AllocationRequest, Allocator, RequestStatus};
use crate::clock::Clock;
use crate::error::{EngineError, PipelineStageFailure};
use crate::model::{PipelineRun, Reservation, Resource, StageOutput};
use crate::policy::Requester;
use crate::registry::Registry;
use crate::selection::Requirements;

const STAGE_ORDER: [StageKind; 4] = [
    StageKind::Build,
    StageKind::Deploy,
    StageKind::Boot,
    StageKind::Test,
];

/// What to run and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub requester: Requester,
    /// In order; the full list or a deployment-only tail.
    pub stages: Vec<StageKind>,
    /// Build server requirements for `build`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Requirements>,
    /// Host or board requirements for `deploy`, `boot` and `test`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Requirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_ttl: Option<Duration>,
}

impl PipelineConfig {
    /// build, deploy, boot and test.
    pub fn full(
        name: impl Into<String>,
        requester: Requester,
        build: Requirements,
        deploy: Requirements,
    ) -> Self {
        Self {
            name: name.into(),
            requester,
            stages: STAGE_ORDER.to_vec(),
            build: Some(build),
            deploy: Some(deploy),
            reservation_ttl: None,
        }
    }

    /// deploy, boot and test of an existing image.
    pub fn deployment_only(name: impl Into<String>, requester: Requester, deploy: Requirements) -> Self {
        Self {
            name: name.into(),
            requester,
            stages: STAGE_ORDER[1..].to_vec(),
            build: None,
            deploy: Some(deploy),
            reservation_ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = Some(ttl);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidConfig("name is empty".to_string()));
        }
        if self.stages.is_empty() {
            return Err(EngineError::InvalidConfig("no stages".to_string()));
        }

        let ranks: Vec<usize> = self
            .stages
            .iter()
            .map(|s| STAGE_ORDER.iter().position(|o| o == s).unwrap_or(usize::MAX))
            .collect();
        if ranks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(EngineError::InvalidConfig(format!(
                "stages must be a subsequence of build, deploy, boot, test; got {:?}",
                self.stages
            )));
        }

        let has = |kind| self.stages.contains(&kind);
        if has(StageKind::Build) {
            match &self.build {
                Some(r) if r.kind() == ResourceKind::BuildServer => {}
                Some(r) => {
                    return Err(EngineError::InvalidConfig(format!(
                        "build stage needs build server requirements, got {}",
                        r.kind()
                    )))
                }
                None => return Err(EngineError::InvalidConfig("build stage without build requirements".to_string())),
            }
        }
        if (has(StageKind::Boot) || has(StageKind::Test)) && !has(StageKind::Deploy) {
            return Err(EngineError::InvalidConfig(
                "boot and test run on the deployed resource and need a deploy stage".to_string(),
            ));
        }
        if has(StageKind::Deploy) {
            match &self.deploy {
                Some(r) if matches!(r.kind(), ResourceKind::Host | ResourceKind::Board) => {}
                Some(_) => {
                    return Err(EngineError::InvalidConfig(
                        "deploy requirements must target a host or a board".to_string(),
                    ))
                }
                None => return Err(EngineError::InvalidConfig("deploy stage without deploy requirements".to_string())),
            }
        }
        Ok(())
    }
}

struct RunSlot {
    config: PipelineConfig,
    run: Mutex<PipelineRun>,
    cancel_tx: watch::Sender<bool>,
    status_tx: watch::Sender<PipelineStatus>,
}

struct Held {
    resource: Resource,
    reservation: Reservation,
}

enum Acquired {
    Held(Held),
    Refused(String),
    Cancelled,
}

/// Resolves when the run is cancelled.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct PipelineSequencer {
    allocator: Arc<Allocator>,
    registry: Arc<Registry>,
    executor: Arc<dyn StageExecutor>,
    alerts: AlertEmitter,
    clock: Arc<dyn Clock>,
    runs: RwLock<HashMap<PipelineId, Arc<RunSlot>>>,
}

impl PipelineSequencer {
    pub fn new(
        allocator: Arc<Allocator>,
        registry: Arc<Registry>,
        executor: Arc<dyn StageExecutor>,
        alerts: AlertEmitter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            allocator,
            registry,
            executor,
            alerts,
            clock,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and start a run. Returns as soon as it is queued for execution.
    #[instrument(skip(self, config), fields(name = %config.name, requester = %config.requester.id))]
    pub async fn run_pipeline(self: &Arc<Self>, config: PipelineConfig) -> Result<PipelineId, EngineError> {
        config.validate()?;

        let id = PipelineId::new();
        let run = PipelineRun::new(
            id,
            config.name.clone(),
            config.requester.id.clone(),
            &config.stages,
            self.clock.now(),
        );
        let slot = Arc::new(RunSlot {
            config,
            run: Mutex::new(run),
            cancel_tx: watch::channel(false).0,
            status_tx: watch::channel(PipelineStatus::Pending).0,
        });
        self.runs.write().await.insert(id, slot.clone());

        info!(pipeline_id = %id, stages = ?slot.config.stages, "Pipeline created");
        self.emit(id, event_types::PIPELINE_CREATED, Severity::Info, PipelineStatus::Pending, None, None, None);

        self.spawn_drive(slot, 0);
        Ok(id)
    }

    pub async fn get(&self, id: &PipelineId) -> Result<PipelineRun, EngineError> {
        let slot = self.slot(id).await?;
        let run = slot.run.lock().await;
        Ok(run.clone())
    }

    pub async fn list(&self) -> Vec<PipelineRun> {
        let slots: Vec<Arc<RunSlot>> = self.runs.read().await.values().cloned().collect();
        let mut runs = Vec::with_capacity(slots.len());
        for slot in slots {
            runs.push(slot.run.lock().await.clone());
        }
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Cancel a run and release everything it holds.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &PipelineId) -> Result<PipelineRun, EngineError> {
        let slot = self.slot(id).await?;

        let (reservations, stage) = {
            let mut run = slot.run.lock().await;
            run.cancel(self.clock.now())?;
            (
                std::mem::take(&mut run.reservations),
                run.current_stage.map(|i| run.stages[i].kind),
            )
        };
        slot.cancel_tx.send_replace(true);

        for reservation in &reservations {
            self.allocator.release(reservation).await;
        }

        info!(pipeline_id = %id, released = reservations.len(), "Pipeline cancelled");
        self.emit(
            *id,
            event_types::PIPELINE_CANCELLED,
            Severity::Info,
            PipelineStatus::Cancelled,
            stage,
            Some(StageStatus::Cancelled),
            None,
        );
        slot.status_tx.send_replace(PipelineStatus::Cancelled);

        self.get(id).await
    }

    /// Re-run a failed run from its failed stage.
    #[instrument(skip(self))]
    pub async fn retry_stage(self: &Arc<Self>, id: &PipelineId, stage: StageKind) -> Result<PipelineRun, EngineError> {
        let slot = self.slot(id).await?;

        let (index, snapshot) = {
            let mut run = slot.run.lock().await;
            let index = run.reset_from(stage)?;
            slot.status_tx.send_replace(PipelineStatus::Running);
            (index, run.clone())
        };

        info!(pipeline_id = %id, stage = %stage, retries = snapshot.retries, "Pipeline stage retried");
        self.emit(
            *id,
            event_types::PIPELINE_RETRIED,
            Severity::Info,
            PipelineStatus::Running,
            Some(stage),
            Some(StageStatus::Pending),
            None,
        );

        self.spawn_drive(slot, index);
        Ok(snapshot)
    }

    /// Wait until the run is terminal.
    pub async fn wait(&self, id: &PipelineId) -> Result<PipelineRun, EngineError> {
        let slot = self.slot(id).await?;
        let mut status = slot.status_tx.subscribe();
        loop {
            let terminal = status.borrow_and_update().is_terminal();
            if terminal || status.changed().await.is_err() {
                break;
            }
        }
        let run = slot.run.lock().await;
        Ok(run.clone())
    }

    async fn slot(&self, id: &PipelineId) -> Result<Arc<RunSlot>, EngineError> {
        self.runs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(EngineError::PipelineNotFound(*id))
    }

    fn spawn_drive(self: &Arc<Self>, slot: Arc<RunSlot>, from: usize) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(slot, from).await });
    }

    #[instrument(skip_all, fields(pipeline_id = tracing::field::Empty))]
    async fn drive(self: Arc<Self>, slot: Arc<RunSlot>, from: usize) {
        let pipeline_id = slot.run.lock().await.id;
        tracing::Span::current().record("pipeline_id", tracing::field::display(pipeline_id));

        let mut cancel = slot.cancel_tx.subscribe();
        let mut target: Option<Held> = None;

        for index in from..slot.config.stages.len() {
            let kind = slot.config.stages[index];

            let mut held = match (kind, target.take()) {
                (StageKind::Boot | StageKind::Test, Some(held)) => held,
                _ => {
                    let requirements = match self.requirements_for(&slot, kind).await {
                        Some(r) => r,
                        None => {
                            self.fail(&slot, index, format!("no requirements for {kind}"), None, false)
                                .await;
                            return;
                        }
                    };
                    match self.acquire(&slot, requirements, true, &mut cancel).await {
                        Acquired::Held(held) => held,
                        Acquired::Cancelled => return,
                        Acquired::Refused(reason) => {
                            self.fail(&slot, index, reason, None, false).await;
                            return;
                        }
                    }
                }
            };

            if let Err(e) = self.start(&slot, index, &held).await {
                debug!(stage = %kind, error = %e, "Stage not started");
                self.release_held(&slot, &held).await;
                return;
            }

            let mut alternative_attempted = false;
            let mut attempt = 1;
            let result = loop {
                let result = match self.execute(&slot, kind, attempt, &held, &mut cancel).await {
                    Some(result) => result,
                    None => return,
                };

                match result {
                    Err(failure)
                        if kind == StageKind::Deploy && failure.resource_specific && !alternative_attempted =>
                    {
                        alternative_attempted = true;
                        attempt += 1;
                        warn!(
                            resource_id = %held.resource.id,
                            reason = %failure.reason,
                            "Deploy failed on resource, trying an alternative"
                        );

                        match self.switch_target(&slot, index, &held, &failure, &mut cancel).await {
                            Acquired::Held(next) => held = next,
                            Acquired::Cancelled => return,
                            Acquired::Refused(reason) => {
                                let failed_on = held.resource.id.clone();
                                self.fail(
                                    &slot,
                                    index,
                                    format!("{}; no alternative resource: {reason}", failure.reason),
                                    Some(failed_on),
                                    true,
                                )
                                .await;
                                return;
                            }
                        }
                    }
                    other => break other,
                }
            };

            match result {
                Ok(output) => {
                    if let Err(e) = self.complete(&slot, index, output).await {
                        debug!(stage = %kind, error = %e, "Stage completion not recorded");
                        self.release_held(&slot, &held).await;
                        return;
                    }
                    if kind == StageKind::Build {
                        self.release_held(&slot, &held).await;
                    } else {
                        target = Some(held);
                    }
                }
                Err(failure) => {
                    self.fail(
                        &slot,
                        index,
                        failure.reason,
                        Some(held.resource.id.clone()),
                        alternative_attempted,
                    )
                    .await;
                    return;
                }
            }
        }

        if let Some(held) = target {
            self.release_held(&slot, &held).await;
        }

        let completed = slot.run.lock().await.status == PipelineStatus::Completed;
        if completed {
            info!("Pipeline completed");
            self.emit(
                pipeline_id,
                event_types::PIPELINE_COMPLETED,
                Severity::Info,
                PipelineStatus::Completed,
                None,
                None,
                None,
            );
            slot.status_tx.send_replace(PipelineStatus::Completed);
        }
    }

    async fn requirements_for(&self, slot: &RunSlot, kind: StageKind) -> Option<Requirements> {
        match kind {
            StageKind::Build => slot.config.build.clone(),
            StageKind::Deploy => slot.config.deploy.clone(),
            // Resuming after a retry: go back to where the image was deployed.
            StageKind::Boot | StageKind::Test => {
                let deployed_on = slot
                    .run
                    .lock()
                    .await
                    .stage(StageKind::Deploy)
                    .and_then(|s| s.resource_id.clone());
                let requirements = slot.config.deploy.clone()?;
                Some(match deployed_on {
                    Some(id) => requirements.pinned_to(id),
                    None => requirements,
                })
            }
        }
    }

    async fn acquire(
        &self,
        slot: &RunSlot,
        requirements: Requirements,
        queue: bool,
        cancel: &mut watch::Receiver<bool>,
    ) -> Acquired {
        let mut grants = self.allocator.subscribe_grants();

        let mut request = AllocationRequest::new(slot.config.requester.clone(), requirements);
        if let Some(ttl) = slot.config.reservation_ttl {
            request = request.with_ttl(ttl);
        }
        if !queue {
            request = request.without_queue();
        }
        let request_id = request.request_id;

        let reservation = match self.allocator.select_and_reserve(request).await {
            Err(e) => return Acquired::Refused(e.to_string()),
            Ok(AllocationOutcome::Denied { reason, .. }) => return Acquired::Refused(reason),
            Ok(AllocationOutcome::Reserved { reservation, .. }) => reservation,
            Ok(AllocationOutcome::Queued { position, reason, .. }) => {
                info!(request_id = %request_id, position, reason = %reason, "Pipeline waiting for a resource");
                match self.wait_for_grant(request_id, &mut grants, cancel).await {
                    Some(reservation) => reservation,
                    None if *cancel.borrow() => return Acquired::Cancelled,
                    None => return Acquired::Refused(format!("request {request_id} was withdrawn")),
                }
            }
        };

        self.hold(slot, reservation).await
    }

    async fn wait_for_grant(
        &self,
        request_id: RequestId,
        grants: &mut watch::Receiver<u64>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<Reservation> {
        loop {
            match self.allocator.request_status(&request_id).await {
                RequestStatus::Granted { reservation } => return Some(reservation),
                RequestStatus::Unknown => return None,
                RequestStatus::Queued { .. } => {}
            }

            tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    if !self.allocator.withdraw(&request_id).await {
                        // Granted while we were being cancelled.
                        if let RequestStatus::Granted { reservation } = self.allocator.request_status(&request_id).await {
                            self.allocator.release(&reservation.id).await;
                        }
                    }
                    return None;
                }
                changed = grants.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Record a fresh grant on the run, or give it back if the run ended.
    async fn hold(&self, slot: &RunSlot, reservation: Reservation) -> Acquired {
        let Some(resource) = self.registry.get(&reservation.resource_id).await else {
            self.allocator.release(&reservation.id).await;
            return Acquired::Refused(format!("{} was decommissioned", reservation.resource_id));
        };

        let mut run = slot.run.lock().await;
        if run.is_terminal() {
            drop(run);
            self.allocator.release(&reservation.id).await;
            return Acquired::Cancelled;
        }
        run.reservations.push(reservation.id);
        Acquired::Held(Held { resource, reservation })
    }

    async fn release_held(&self, slot: &RunSlot, held: &Held) {
        slot.run
            .lock()
            .await
            .reservations
            .retain(|id| *id != held.reservation.id);
        self.allocator.release(&held.reservation.id).await;
    }

    async fn switch_target(
        &self,
        slot: &RunSlot,
        index: usize,
        failed: &Held,
        failure: &StageFailure,
        cancel: &mut watch::Receiver<bool>,
    ) -> Acquired {
        {
            let mut run = slot.run.lock().await;
            if let Err(e) = run.record_failed_attempt(index, failure.reason.clone(), self.clock.now()) {
                debug!(error = %e, "Failed attempt not recorded");
                return Acquired::Cancelled;
            }
        }
        self.release_held(slot, failed).await;

        let Some(mut requirements) = slot.config.deploy.clone() else {
            return Acquired::Refused("no deploy requirements".to_string());
        };
        requirements.pinned = None;
        let requirements = requirements.excluding(failed.resource.id.clone());

        let acquired = self.acquire(slot, requirements, false, cancel).await;
        if let Acquired::Held(next) = &acquired {
            let mut run = slot.run.lock().await;
            if let Err(e) = run.assign_resource(index, next.resource.id.clone()) {
                drop(run);
                debug!(error = %e, "Alternative resource not assigned");
                self.release_held(slot, next).await;
                return Acquired::Cancelled;
            }
            info!(
                resource_id = %next.resource.id,
                failed_on = %failed.resource.id,
                "Deploy retrying on alternative resource"
            );
            self.emit(
                run.id,
                event_types::PIPELINE_STAGE_CHANGED,
                Severity::Warning,
                run.status,
                Some(StageKind::Deploy),
                Some(StageStatus::Running),
                Some(format!(
                    "{} failed ({}), retrying on {}",
                    failed.resource.id, failure.reason, next.resource.id
                )),
            );
        }
        acquired
    }

    async fn start(&self, slot: &RunSlot, index: usize, held: &Held) -> Result<(), EngineError> {
        let mut run = slot.run.lock().await;
        run.start_stage(index, self.clock.now())?;
        run.assign_resource(index, held.resource.id.clone())?;

        let kind = run.stages[index].kind;
        info!(stage = %kind, resource_id = %held.resource.id, reservation_id = %held.reservation.id, "Stage started");
        self.emit(
            run.id,
            event_types::PIPELINE_STAGE_CHANGED,
            Severity::Info,
            run.status,
            Some(kind),
            Some(StageStatus::Running),
            Some(held.resource.id.to_string()),
        );
        slot.status_tx.send_replace(run.status);
        Ok(())
    }

    async fn execute(
        &self,
        slot: &RunSlot,
        kind: StageKind,
        attempt: u32,
        held: &Held,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<Result<StageOutput, StageFailure>> {
        let ctx = {
            let run = slot.run.lock().await;
            StageContext {
                pipeline_id: run.id,
                pipeline_name: run.name.clone(),
                stage: kind,
                attempt,
                resource: held.resource.clone(),
                previous_outputs: run.outputs(),
            }
        };

        tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                debug!(stage = %kind, "Stage interrupted by cancellation");
                None
            }
            result = self.executor.execute(&ctx) => Some(result),
        }
    }

    async fn complete(&self, slot: &RunSlot, index: usize, output: StageOutput) -> Result<(), EngineError> {
        let mut run = slot.run.lock().await;
        run.complete_stage(index, output, self.clock.now())?;

        let kind = run.stages[index].kind;
        info!(stage = %kind, "Stage completed");
        self.emit(
            run.id,
            event_types::PIPELINE_STAGE_CHANGED,
            Severity::Info,
            run.status,
            Some(kind),
            Some(StageStatus::Completed),
            None,
        );
        Ok(())
    }

    async fn fail(
        &self,
        slot: &RunSlot,
        index: usize,
        reason: String,
        resource_id: Option<ResourceId>,
        alternative_attempted: bool,
    ) {
        let (pipeline_id, kind, reservations) = {
            let mut run = slot.run.lock().await;
            let kind = run.stages[index].kind;
            let failure = PipelineStageFailure {
                pipeline_id: run.id,
                stage: kind,
                reason: reason.clone(),
                resource_id,
                alternative_attempted,
            };
            if let Err(e) = run.fail_stage(index, failure, self.clock.now()) {
                debug!(stage = %kind, error = %e, "Stage failure not recorded");
                return;
            }
            (run.id, kind, std::mem::take(&mut run.reservations))
        };

        for reservation in &reservations {
            self.allocator.release(reservation).await;
        }

        error!(stage = %kind, reason = %reason, alternative_attempted, "Pipeline failed");
        self.emit(
            pipeline_id,
            event_types::PIPELINE_FAILED,
            Severity::Warning,
            PipelineStatus::Failed,
            Some(kind),
            Some(StageStatus::Failed),
            Some(reason),
        );
        slot.status_tx.send_replace(PipelineStatus::Failed);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        pipeline_id: PipelineId,
        event_type: &str,
        severity: Severity,
        status: PipelineStatus,
        stage: Option<StageKind>,
        stage_status: Option<StageStatus>,
        detail: Option<String>,
    ) {
        self.alerts.emit(
            EventEnvelope::builder()
                .aggregate(AggregateType::Pipeline, pipeline_id.to_string())
                .event_type(event_type)
                .severity(severity)
                .payload(PipelinePayload {
                    pipeline_id,
                    status,
                    stage,
                    stage_status,
                    detail,
                }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ScoringWeights;
    use crate::model::{BuildServerSpec, Capacity, ConnectionInfo, HostSpec, ResourceSpec};
    use crate::pipeline::ScriptedExecutor;
    use crate::reservation::ReservationManager;
    use testfarm_events::ResourceStatus;

    struct Fixture {
        reservations: Arc<ReservationManager>,
        allocator: Arc<Allocator>,
        executor: Arc<ScriptedExecutor>,
        sequencer: Arc<PipelineSequencer>,
    }

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    fn capacity() -> Capacity {
        Capacity {
            cpu_cores: 16,
            memory_mb: 65_536,
            storage_gb: 1_000,
            architectures: ["x86_64".to_string()].into(),
        }
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::fixed());
        let registry = Arc::new(Registry::new(16));
        let alerts = AlertEmitter::new(clock.clone(), 256);

        registry
            .insert(
                Resource::new(
                    id("S1"),
                    ResourceSpec::BuildServer(BuildServerSpec {
                        toolchains: ["gcc-13".to_string()].into(),
                        max_concurrent_jobs: 1,
                    }),
                    capacity(),
                    ConnectionInfo::new("s1"),
                )
                .with_status(ResourceStatus::Online),
            )
            .await
            .unwrap();
        for h in ["H1", "H2"] {
            registry
                .insert(
                    Resource::new(
                        id(h),
                        ResourceSpec::Host(HostSpec {
                            kvm: true,
                            nested_virt: false,
                            max_vms: 4,
                        }),
                        capacity(),
                        ConnectionInfo::new(h),
                    )
                    .with_status(ResourceStatus::Online),
                )
                .await
                .unwrap();
        }

        let reservations = Arc::new(ReservationManager::new(registry.clone(), clock.clone(), alerts.clone()));
        let allocator = Arc::new(Allocator::new(
            registry.clone(),
            reservations.clone(),
            alerts.clone(),
            clock.clone(),
            ScoringWeights::default(),
            Duration::from_secs(3600),
        ));
        let executor = Arc::new(ScriptedExecutor::new());
        let sequencer = Arc::new(PipelineSequencer::new(
            allocator.clone(),
            registry,
            executor.clone(),
            alerts,
            clock,
        ));

        Fixture {
            reservations,
            allocator,
            executor,
            sequencer,
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::full(
            "kernel-ci",
            Requester::new("ci-4711"),
            Requirements::build_server("x86_64").with_toolchain("gcc-13"),
            Requirements::host("x86_64").require_kvm(),
        )
    }

    fn statuses(run: &PipelineRun) -> Vec<StageStatus> {
        run.stages.iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn test_pipeline_runs_all_stages_in_order() {
        let f = fixture().await;
        let pid = f.sequencer.run_pipeline(config()).await.unwrap();
        let run = f.sequencer.wait(&pid).await.unwrap();

        assert_eq!(run.status, PipelineStatus::Completed);
        assert_eq!(statuses(&run), vec![StageStatus::Completed; 4]);
        assert_eq!(
            f.executor.calls(),
            vec![
                (StageKind::Build, id("S1")),
                (StageKind::Deploy, id("H1")),
                (StageKind::Boot, id("H1")),
                (StageKind::Test, id("H1")),
            ]
        );
        for pair in run.stages.windows(2) {
            assert!(pair[1].started_at >= pair[0].finished_at);
        }
        assert!(f.reservations.active().await.is_empty());
        assert!(run.reservations.is_empty());
    }

    #[tokio::test]
    async fn test_deploy_retries_once_on_alternative_host() {
        let f = fixture().await;
        f.executor
            .fail_on(StageKind::Deploy, &id("H1"), StageFailure::resource("H1 unreachable"));

        let pid = f.sequencer.run_pipeline(config()).await.unwrap();
        let run = f.sequencer.wait(&pid).await.unwrap();

        assert_eq!(run.status, PipelineStatus::Completed);
        let deploy = run.stage(StageKind::Deploy).unwrap();
        assert_eq!(deploy.attempts.len(), 2);
        assert_eq!(deploy.attempts[0].resource_id, Some(id("H1")));
        assert_eq!(deploy.resource_id, Some(id("H2")));
        assert_eq!(run.stage(StageKind::Test).unwrap().resource_id, Some(id("H2")));
        assert!(f.reservations.active().await.is_empty());
    }

    #[tokio::test]
    async fn test_deploy_fails_after_single_alternative() {
        let f = fixture().await;
        for h in ["H1", "H2"] {
            f.executor
                .fail_on(StageKind::Deploy, &id(h), StageFailure::resource(format!("{h} unreachable")));
        }

        let pid = f.sequencer.run_pipeline(config()).await.unwrap();
        let run = f.sequencer.wait(&pid).await.unwrap();

        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(
            statuses(&run),
            vec![
                StageStatus::Completed,
                StageStatus::Failed,
                StageStatus::Skipped,
                StageStatus::Skipped,
            ]
        );
        let failure = run.failure.clone().unwrap();
        assert!(failure.alternative_attempted);
        assert_eq!(failure.resource_id, Some(id("H2")));
        assert!(run.outputs().contains_key(&StageKind::Build));
        assert_eq!(
            f.executor
                .calls()
                .iter()
                .filter(|(s, _)| *s == StageKind::Deploy)
                .count(),
            2
        );
        assert!(f.reservations.active().await.is_empty());
    }

    #[tokio::test]
    async fn test_job_failure_is_not_retried_elsewhere() {
        let f = fixture().await;
        f.executor
            .fail_once(StageKind::Deploy, StageFailure::job("image corrupt"));

        let pid = f.sequencer.run_pipeline(config()).await.unwrap();
        let run = f.sequencer.wait(&pid).await.unwrap();

        assert_eq!(run.status, PipelineStatus::Failed);
        assert!(!run.failure.unwrap().alternative_attempted);
    }

    #[tokio::test]
    async fn test_retry_failed_test_stage_reuses_deploy_host() {
        let f = fixture().await;
        f.executor.fail_once(StageKind::Test, StageFailure::job("flaky"));

        let pid = f.sequencer.run_pipeline(config()).await.unwrap();
        let failed = f.sequencer.wait(&pid).await.unwrap();
        assert_eq!(failed.status, PipelineStatus::Failed);
        assert!(f.sequencer.retry_stage(&pid, StageKind::Build).await.is_err());

        f.sequencer.retry_stage(&pid, StageKind::Test).await.unwrap();
        let run = f.sequencer.wait(&pid).await.unwrap();

        assert_eq!(run.status, PipelineStatus::Completed);
        assert_eq!(run.retries, 1);
        let calls = f.executor.calls();
        assert_eq!(calls.iter().filter(|(s, _)| *s == StageKind::Build).count(), 1);
        assert_eq!(calls.last(), Some(&(StageKind::Test, id("H1"))));
        assert!(f.reservations.active().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_releases_reservations_immediately() {
        let f = fixture().await;
        f.executor.delay(StageKind::Test, Duration::from_secs(30));

        let pid = f.sequencer.run_pipeline(config()).await.unwrap();
        loop {
            let run = f.sequencer.get(&pid).await.unwrap();
            if run.stage(StageKind::Test).unwrap().status == StageStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(f.reservations.active().await.len(), 1);

        let run = f.sequencer.cancel(&pid).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Cancelled);
        assert_eq!(run.stage(StageKind::Test).unwrap().status, StageStatus::Cancelled);
        assert!(f.reservations.active().await.is_empty());
        assert!(f.sequencer.cancel(&pid).await.is_err());
    }

    #[tokio::test]
    async fn test_build_waits_in_queue_for_busy_server() {
        let f = fixture().await;
        let blocker = f
            .allocator
            .select_and_reserve(AllocationRequest::new(
                Requester::new("other-build"),
                Requirements::build_server("x86_64"),
            ))
            .await
            .unwrap();
        let blocker = blocker.reservation().unwrap().id;

        let pid = f.sequencer.run_pipeline(config()).await.unwrap();
        loop {
            if !f.allocator.queued().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(
            f.sequencer.get(&pid).await.unwrap().stages[0].status,
            StageStatus::Pending
        );

        f.allocator.release(&blocker).await;
        let run = f.sequencer.wait(&pid).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Completed);
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        assert!(PipelineConfig::deployment_only("deploy", Requester::new("d"), Requirements::board())
            .validate()
            .is_ok());

        let mut out_of_order = config();
        out_of_order.stages = vec![StageKind::Deploy, StageKind::Build];
        assert!(out_of_order.validate().is_err());

        let mut no_deploy = config();
        no_deploy.stages = vec![StageKind::Build, StageKind::Test];
        assert!(no_deploy.validate().is_err());

        let mut wrong_kind = config();
        wrong_kind.deploy = Some(Requirements::build_server("x86_64"));
        assert!(wrong_kind.validate().is_err());

        let mut no_build = config();
        no_build.build = None;
        assert!(matches!(no_build.validate(), Err(EngineError::InvalidConfig(_))));
    }
}
