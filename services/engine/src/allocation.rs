//! Allocation: selection, policy and reservation in one call.
//!
//! `select_and_reserve` asks the strategy for a ranked candidate list, then
//! walks it: authorize against the candidate's group, reserve, and fall
//! through to the next candidate when a reservation loses a race. A group's
//! authorize and reserve run under that group's admission lock so two
//! requests cannot both pass a max-concurrent check for the last slot.
//!
//! Requests nothing can serve are queued (unless the caller opts out) and
//! retried in priority order after every release or expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use testfarm_events::{
    event_types, ActorType, AggregateType, AllocationPayload, EventEnvelope, ResourceStatus,
    Severity,
};
use testfarm_id::{GroupId, RequestId, ReservationId, ResourceId};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::alerts::AlertEmitter;
use crate::clock::Clock;
use crate::config::ScoringWeights;
use crate::error::{CapacityError, EngineError, PolicyDenied};
use crate::model::{Holder, Reservation, Resource};
use crate::policy::{AllocationPolicyEnforcer, PolicyDecision, PolicyTarget, Requester};
use crate::queue::{AllocationQueue, QueuedRequest};
use crate::registry::Registry;
use crate::reservation::{ReservationDenied, ReservationManager};
use crate::selection::{strategy_for, Requirements, SelectionContext, SelectionResult};

/// A request for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub request_id: RequestId,
    pub requester: Requester,
    pub requirements: Requirements,
    /// Reservation lifetime; the configured default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    /// Wait in the queue when nothing is free, instead of being denied.
    #[serde(default = "default_true")]
    pub queue_on_miss: bool,
}

fn default_true() -> bool {
    true
}

impl AllocationRequest {
    pub fn new(requester: Requester, requirements: Requirements) -> Self {
        Self {
            request_id: RequestId::new(),
            requester,
            requirements,
            ttl: None,
            queue_on_miss: true,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Deny instead of queueing when nothing is free.
    pub fn without_queue(mut self) -> Self {
        self.queue_on_miss = false;
        self
    }
}

impl From<QueuedRequest> for AllocationRequest {
    fn from(queued: QueuedRequest) -> Self {
        Self {
            request_id: queued.request_id,
            requester: queued.requester,
            requirements: queued.requirements,
            ttl: queued.ttl,
            queue_on_miss: true,
        }
    }
}

/// Why a request was turned down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Denial {
    Policy(PolicyDenied),
    Capacity(CapacityError),
}

/// Answer to `select_and_reserve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AllocationOutcome {
    Reserved {
        resource: Resource,
        reservation: Reservation,
        /// Other resources that would have served the request.
        alternatives: Vec<ResourceId>,
    },
    Queued {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_wait: Option<Duration>,
        alternatives: Vec<ResourceId>,
        reason: String,
        /// 1-based position in the wait queue.
        position: usize,
    },
    Denied {
        reason: String,
        denial: Denial,
    },
}

impl AllocationOutcome {
    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            Self::Reserved { reservation, .. } => Some(reservation),
            _ => None,
        }
    }
}

/// Where a request stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestStatus {
    Queued { position: usize, request: QueuedRequest },
    Granted { reservation: Reservation },
    Unknown,
}

enum Attempt {
    Reserved {
        resource: Resource,
        reservation: Reservation,
        alternatives: Vec<ResourceId>,
    },
    PolicyDenied(PolicyDenied),
    Unserved {
        selection: SelectionResult,
        lost_race: Option<ReservationDenied>,
    },
}

pub struct Allocator {
    registry: Arc<Registry>,
    reservations: Arc<ReservationManager>,
    policy: AllocationPolicyEnforcer,
    queue: AllocationQueue,
    alerts: AlertEmitter,
    clock: Arc<dyn Clock>,
    weights: ScoringWeights,
    default_ttl: Duration,
    admission: Mutex<HashMap<GroupId, Arc<tokio::sync::Mutex<()>>>>,
    draining: tokio::sync::Mutex<()>,
    grants: tokio::sync::Mutex<HashMap<RequestId, Reservation>>,
    granted_tx: watch::Sender<u64>,
}

impl Allocator {
    pub fn new(
        registry: Arc<Registry>,
        reservations: Arc<ReservationManager>,
        alerts: AlertEmitter,
        clock: Arc<dyn Clock>,
        weights: ScoringWeights,
        default_ttl: Duration,
    ) -> Self {
        Self {
            policy: AllocationPolicyEnforcer::new(registry.clone(), reservations.clone(), alerts.clone()),
            registry,
            reservations,
            queue: AllocationQueue::new(),
            alerts,
            clock,
            weights,
            default_ttl,
            admission: Mutex::new(HashMap::new()),
            draining: tokio::sync::Mutex::new(()),
            grants: tokio::sync::Mutex::new(HashMap::new()),
            granted_tx: watch::channel(0).0,
        }
    }

    pub fn policy(&self) -> &AllocationPolicyEnforcer {
        &self.policy
    }

    /// Ticks whenever a queue drain grants at least one request.
    pub fn subscribe_grants(&self) -> watch::Receiver<u64> {
        self.granted_tx.subscribe()
    }

    fn admission_lock(&self, group_id: &GroupId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(group_id.clone()).or_default().clone()
    }

    /// Pick a resource without reserving it.
    pub async fn select(&self, requirements: &Requirements) -> SelectionResult {
        self.select_in(requirements).await.0
    }

    async fn select_in(&self, requirements: &Requirements) -> (SelectionResult, Vec<Resource>) {
        let snapshot = self.registry.snapshot().await;
        let busy_until = self.reservations.busy_until().await;
        let ctx = SelectionContext {
            resources: &snapshot,
            busy_until: &busy_until,
            now: self.clock.now(),
            weights: self.weights,
        };

        let result = strategy_for(requirements.kind()).select(requirements, &ctx);
        match &result.resource {
            Some(resource) => debug!(
                kind = %requirements.kind(),
                resource_id = %resource.id,
                alternatives = result.alternatives.len(),
                "Selected resource"
            ),
            None => info!(
                kind = %requirements.kind(),
                reason = result.reason.as_deref().unwrap_or_default(),
                estimated_wait_secs = ?result.estimated_wait.map(|w| w.as_secs()),
                "No resource selectable"
            ),
        }
        (result, snapshot)
    }

    /// Select, authorize and reserve.
    ///
    /// Selection and policy outcomes come back as [`AllocationOutcome`];
    /// `Err` is reserved for lookups that fail outright (unknown group).
    #[instrument(skip(self, request), fields(request_id = %request.request_id, requester = %request.requester.id))]
    pub async fn select_and_reserve(&self, request: AllocationRequest) -> Result<AllocationOutcome, EngineError> {
        let attempt = self.attempt(&request).await?;

        let (selection, lost_race) = match attempt {
            Attempt::Reserved {
                resource,
                reservation,
                alternatives,
            } => {
                return Ok(AllocationOutcome::Reserved {
                    resource,
                    reservation,
                    alternatives,
                })
            }
            Attempt::PolicyDenied(denied) => {
                let reason = denied.to_string();
                self.emit_allocation(&request, event_types::ALLOCATION_DENIED, Severity::Warning, &reason, None, None);
                return Ok(AllocationOutcome::Denied {
                    reason,
                    denial: Denial::Policy(denied),
                });
            }
            Attempt::Unserved { selection, lost_race } => (selection, lost_race),
        };

        let reason = match (&lost_race, &selection.reason) {
            (Some(denied), _) => denied.to_string(),
            (None, Some(reason)) => reason.clone(),
            (None, None) => "no resource free".to_string(),
        };

        if !request.queue_on_miss {
            self.emit_allocation(&request, event_types::ALLOCATION_DENIED, Severity::Warning, &reason, None, None);
            return Ok(AllocationOutcome::Denied {
                reason: reason.clone(),
                denial: Denial::Capacity(CapacityError {
                    resource_id: lost_race
                        .map(|d| d.resource_id)
                        .or_else(|| request.requirements.pinned.clone()),
                    reason,
                    alternatives: selection.alternatives,
                }),
            });
        }

        let priority_group = match &request.requirements.group_id {
            Some(group_id) => Some(group_id.clone()),
            None => match &request.requirements.pinned {
                Some(pinned) => self.registry.get(pinned).await.and_then(|r| r.group_id),
                None => None,
            },
        };
        let priority = self
            .policy
            .effective_priority(priority_group.as_ref(), &request.requester)
            .await;

        let position = self
            .queue
            .enqueue(QueuedRequest {
                request_id: request.request_id,
                requester: request.requester.clone(),
                requirements: request.requirements.clone(),
                ttl: request.ttl,
                priority,
                enqueued_at: self.clock.now(),
                reason: reason.clone(),
            })
            .await;

        info!(
            position,
            priority,
            estimated_wait_secs = ?selection.estimated_wait.map(|w| w.as_secs()),
            reason = %reason,
            "Request queued"
        );
        self.emit_allocation(
            &request,
            event_types::ALLOCATION_QUEUED,
            Severity::Info,
            &reason,
            None,
            selection.estimated_wait,
        );

        Ok(AllocationOutcome::Queued {
            request_id: request.request_id,
            estimated_wait: selection.estimated_wait,
            alternatives: selection.alternatives,
            reason,
            position,
        })
    }

    async fn attempt(&self, request: &AllocationRequest) -> Result<Attempt, EngineError> {
        let requirements = &request.requirements;
        let (selection, snapshot) = self.select_in(requirements).await;

        let mut candidates: Vec<&Resource> = selection.resource.iter().collect();
        if requirements.pinned.is_none() {
            candidates.extend(
                selection
                    .alternatives
                    .iter()
                    .filter_map(|id| snapshot.iter().find(|r| &r.id == id)),
            );
        }

        if candidates.is_empty() {
            // A group-scoped request is still subject to its group's rules
            // before it may wait.
            if let Some(group_id) = &requirements.group_id {
                let lock = self.admission_lock(group_id);
                let _admitted = lock.lock().await;
                if let PolicyDecision::Denied(denied) = self
                    .policy
                    .authorize(&PolicyTarget::Group(group_id.clone()), &request.requester)
                    .await?
                {
                    return Ok(Attempt::PolicyDenied(denied));
                }
            }
            return Ok(Attempt::Unserved {
                selection,
                lost_race: None,
            });
        }

        let ttl = request.ttl.unwrap_or(self.default_ttl);
        let mut denied_groups: HashMap<GroupId, PolicyDenied> = HashMap::new();
        let mut lost_race = None;

        for (i, candidate) in candidates.iter().enumerate() {
            if let Some(group_id) = &candidate.group_id {
                if denied_groups.contains_key(group_id) {
                    continue;
                }
            }

            let lock = candidate.group_id.as_ref().map(|g| self.admission_lock(g));
            let _admitted = match &lock {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };

            let decision = match self
                .policy
                .authorize(&PolicyTarget::Resource(candidate.id.clone()), &request.requester)
                .await
            {
                Ok(decision) => decision,
                Err(EngineError::ResourceNotFound(id)) => {
                    debug!(resource_id = %id, "Candidate decommissioned during allocation");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let PolicyDecision::Denied(denied) = decision {
                denied_groups.insert(denied.group_id.clone(), denied);
                continue;
            }

            let holder = Holder {
                requester: request.requester.id.clone(),
                team: request.requester.team.clone(),
                request_id: Some(request.request_id),
            };
            match self
                .reservations
                .reserve(&candidate.id, requirements.slice, ttl, holder)
                .await
            {
                Ok(reservation) => {
                    let resource = self
                        .registry
                        .get(&candidate.id)
                        .await
                        .unwrap_or_else(|| (*candidate).clone());
                    let alternatives = candidates
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, r)| r.id.clone())
                        .collect();
                    return Ok(Attempt::Reserved {
                        resource,
                        reservation,
                        alternatives,
                    });
                }
                Err(denied) => {
                    debug!(
                        resource_id = %candidate.id,
                        reason = %denied.reason,
                        "Candidate taken concurrently, trying next"
                    );
                    lost_race = Some(denied);
                }
            }
        }

        if lost_race.is_none() {
            // Every candidate was refused by policy.
            if let Some(denied) = denied_groups.into_values().next() {
                return Ok(Attempt::PolicyDenied(denied));
            }
        }

        Ok(Attempt::Unserved {
            selection: SelectionResult {
                success: false,
                resource: None,
                ..selection
            },
            lost_race,
        })
    }

    /// Release a reservation and hand freed capacity to waiting requests.
    pub async fn release(&self, id: &ReservationId) -> bool {
        let released = self.reservations.release(id).await;
        if released {
            self.forget_grants(&[*id]).await;
            self.drain_queue().await;
        }
        released
    }

    /// Drop grant records for reservations that no longer exist.
    pub(crate) async fn forget_grants(&self, ids: &[ReservationId]) {
        self.grants
            .lock()
            .await
            .retain(|_, reservation| !ids.contains(&reservation.id));
    }

    /// Retry queued requests in service order.
    ///
    /// A request pinned to a resource that went offline, into maintenance
    /// or out of the registry is redirected to the best alternative.
    #[instrument(skip(self))]
    pub async fn drain_queue(&self) -> Vec<(RequestId, Reservation)> {
        let _draining = self.draining.lock().await;
        let mut granted = Vec::new();

        for queued in self.queue.ordered().await {
            let request_id = queued.request_id;
            let mut request = AllocationRequest::from(queued);

            if let Some(pinned) = request.requirements.pinned.clone() {
                if self.is_lost(&pinned).await {
                    info!(
                        request_id = %request_id,
                        resource_id = %pinned,
                        "Redirecting queued request away from unusable resource"
                    );
                    request.requirements.pinned = None;
                    request.requirements.exclude.insert(pinned);
                }
            }

            let reservation = match self.attempt(&request).await {
                Ok(Attempt::Reserved { reservation, .. }) => reservation,
                Ok(_) => continue,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Queued request could not be retried");
                    continue;
                }
            };

            if self.queue.remove(&request_id).await.is_none() {
                // Withdrawn while we were reserving.
                self.reservations.release(&reservation.id).await;
                continue;
            }

            info!(
                request_id = %request_id,
                resource_id = %reservation.resource_id,
                reservation_id = %reservation.id,
                "Queued request granted"
            );
            self.emit_allocation(
                &request,
                event_types::ALLOCATION_GRANTED_FROM_QUEUE,
                Severity::Info,
                "capacity freed",
                Some(reservation.resource_id.clone()),
                None,
            );
            self.grants.lock().await.insert(request_id, reservation.clone());
            granted.push((request_id, reservation));
        }

        if !granted.is_empty() {
            self.granted_tx.send_modify(|n| *n += 1);
        }
        granted
    }

    async fn is_lost(&self, id: &ResourceId) -> bool {
        match self.registry.get(id).await {
            None => true,
            Some(r) => {
                r.maintenance_mode
                    || r.needs_intervention
                    || matches!(r.status, ResourceStatus::Offline | ResourceStatus::Maintenance)
            }
        }
    }

    /// Waiting requests in service order.
    pub async fn queued(&self) -> Vec<QueuedRequest> {
        self.queue.ordered().await
    }

    /// Cancel a waiting request. False if it is not queued.
    pub async fn withdraw(&self, id: &RequestId) -> bool {
        let withdrawn = self.queue.remove(id).await.is_some();
        if withdrawn {
            info!(request_id = %id, "Queued request withdrawn");
        }
        withdrawn
    }

    pub async fn request_status(&self, id: &RequestId) -> RequestStatus {
        if let Some(reservation) = self.grants.lock().await.get(id) {
            return RequestStatus::Granted {
                reservation: reservation.clone(),
            };
        }
        match (self.queue.get(id).await, self.queue.position(id).await) {
            (Some(request), Some(position)) => RequestStatus::Queued { position, request },
            _ => RequestStatus::Unknown,
        }
    }

    fn emit_allocation(
        &self,
        request: &AllocationRequest,
        event_type: &str,
        severity: Severity,
        reason: &str,
        resource_id: Option<ResourceId>,
        estimated_wait: Option<Duration>,
    ) {
        self.alerts.emit(
            EventEnvelope::builder()
                .aggregate(AggregateType::Reservation, request.request_id.to_string())
                .event_type(event_type)
                .severity(severity)
                .actor(ActorType::Requester, request.requester.id.clone())
                .request_id(request.request_id)
                .payload(AllocationPayload {
                    request_id: request.request_id,
                    kind: request.requirements.kind(),
                    requester: request.requester.id.clone(),
                    reason: reason.to_string(),
                    resource_id,
                    estimated_wait_secs: estimated_wait.map(|w| w.as_secs()),
                }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{
        AllocationPolicy, BoardSpec, Capacity, ConnectionInfo, HostSpec, PowerControl,
        ResourceGroup, ResourceSlice, ResourceSpec,
    };
    use crate::policy::PolicyRule;

    struct Fixture {
        registry: Arc<Registry>,
        allocator: Allocator,
    }

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    fn host(name: &str, cores: u32) -> Resource {
        Resource::new(
            id(name),
            ResourceSpec::Host(HostSpec {
                kvm: true,
                nested_virt: false,
                max_vms: 8,
            }),
            Capacity {
                cpu_cores: cores,
                memory_mb: 32_768,
                storage_gb: 500,
                architectures: ["x86_64".to_string()].into(),
            },
            ConnectionInfo::new(name),
        )
        .with_status(ResourceStatus::Online)
    }

    fn board(name: &str) -> Resource {
        Resource::new(
            id(name),
            ResourceSpec::Board(BoardSpec {
                board_type: "rpi4".to_string(),
                power_control: Some(PowerControl::Pdu {
                    endpoint: "pdu1".to_string(),
                    outlet: 1,
                }),
                ..BoardSpec::default()
            }),
            Capacity {
                architectures: ["arm64".to_string()].into(),
                ..Capacity::default()
            },
            ConnectionInfo::new(name),
        )
        .with_status(ResourceStatus::Available)
    }

    async fn fixture(resources: Vec<Resource>) -> Fixture {
        let clock = Arc::new(ManualClock::fixed());
        let registry = Arc::new(Registry::new(16));
        let alerts = AlertEmitter::new(clock.clone(), 256);
        for r in resources {
            registry.insert(r).await.unwrap();
        }
        let reservations = Arc::new(ReservationManager::new(registry.clone(), clock.clone(), alerts.clone()));
        let allocator = Allocator::new(
            registry.clone(),
            reservations,
            alerts,
            clock,
            ScoringWeights::default(),
            Duration::from_secs(3600),
        );
        Fixture { registry, allocator }
    }

    fn board_request(requester: &str) -> AllocationRequest {
        AllocationRequest::new(
            Requester::new(requester),
            Requirements::board().with_architecture("arm64"),
        )
    }

    #[tokio::test]
    async fn test_board_busy_queues_second_request() {
        let f = fixture(vec![board("B1")]).await;

        let t1 = f.allocator.select_and_reserve(board_request("T1")).await.unwrap();
        assert!(t1.reservation().is_some());

        let t2 = f.allocator.select_and_reserve(board_request("T2")).await.unwrap();
        let AllocationOutcome::Queued {
            estimated_wait,
            position,
            ..
        } = t2
        else {
            panic!("expected queued, got {t2:?}");
        };
        assert_eq!(position, 1);
        assert_eq!(estimated_wait, Some(Duration::from_secs(3600)));
        assert_eq!(
            f.registry.get(&id("B1")).await.unwrap().status,
            ResourceStatus::InUse
        );
    }

    #[tokio::test]
    async fn test_release_grants_queued_request() {
        let f = fixture(vec![board("B1")]).await;
        let t1 = f.allocator.select_and_reserve(board_request("T1")).await.unwrap();
        let t2_request = board_request("T2");
        let t2_id = t2_request.request_id;
        f.allocator.select_and_reserve(t2_request).await.unwrap();

        assert!(f.allocator.release(&t1.reservation().unwrap().id).await);

        let RequestStatus::Granted { reservation } = f.allocator.request_status(&t2_id).await else {
            panic!("T2 should hold B1 now");
        };
        assert_eq!(reservation.holder.requester, "T2");
        assert!(f.allocator.queued().await.is_empty());
    }

    #[tokio::test]
    async fn test_host_capacity_and_least_loaded_choice() {
        let f = fixture(vec![host("H1", 8), host("H2", 8)]).await;
        let request = || {
            AllocationRequest::new(
                Requester::new("vm"),
                Requirements::host("x86_64")
                    .require_kvm()
                    .with_slice(ResourceSlice::cores(4)),
            )
        };

        let first = f.allocator.select_and_reserve(request()).await.unwrap();
        let second = f.allocator.select_and_reserve(request()).await.unwrap();

        assert_eq!(first.reservation().unwrap().resource_id, id("H1"));
        // H1 is now half reserved, so H2 scores lower.
        assert_eq!(second.reservation().unwrap().resource_id, id("H2"));
    }

    #[tokio::test]
    async fn test_max_concurrent_denies_with_idle_resource() {
        let group = GroupId::parse("kernel-boards").unwrap();
        let f = fixture(vec![board("B1"), board("B2"), board("B3")]).await;
        f.registry
            .upsert_group(ResourceGroup::new(
                group.clone(),
                AllocationPolicy {
                    max_concurrent_allocations: Some(2),
                    reserved_for_teams: vec!["kernel".to_string()],
                    priority_boost: 0,
                },
            ))
            .await;
        for b in ["B1", "B2", "B3"] {
            f.registry.assign_group(&id(b), Some(group.clone())).await.unwrap();
        }

        let request = |who: &str| {
            AllocationRequest::new(
                Requester::new(who).with_team("kernel"),
                Requirements::board().in_group(group.clone()),
            )
        };

        assert!(f.allocator.select_and_reserve(request("T1")).await.unwrap().reservation().is_some());
        assert!(f.allocator.select_and_reserve(request("T2")).await.unwrap().reservation().is_some());

        let third = f.allocator.select_and_reserve(request("T3")).await.unwrap();
        let AllocationOutcome::Denied {
            denial: Denial::Policy(denied),
            ..
        } = third
        else {
            panic!("expected policy denial, got {third:?}");
        };
        assert_eq!(denied.rule, PolicyRule::MaxConcurrent);
        assert!(f.allocator.queued().await.is_empty());
    }

    #[tokio::test]
    async fn test_team_restriction_denies() {
        let group = GroupId::parse("kernel-boards").unwrap();
        let f = fixture(vec![board("B1")]).await;
        f.registry
            .upsert_group(ResourceGroup::new(
                group.clone(),
                AllocationPolicy {
                    reserved_for_teams: vec!["kernel".to_string()],
                    ..AllocationPolicy::default()
                },
            ))
            .await;
        f.registry.assign_group(&id("B1"), Some(group)).await.unwrap();

        let outcome = f
            .allocator
            .select_and_reserve(board_request("T1"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AllocationOutcome::Denied {
                denial: Denial::Policy(PolicyDenied {
                    rule: PolicyRule::TeamRestriction,
                    ..
                }),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_without_queue_is_capacity_denial() {
        let f = fixture(vec![host("H1", 2)]).await;
        let outcome = f
            .allocator
            .select_and_reserve(
                AllocationRequest::new(
                    Requester::new("vm"),
                    Requirements::host("x86_64").with_slice(ResourceSlice::cores(4)),
                )
                .without_queue(),
            )
            .await
            .unwrap();

        let AllocationOutcome::Denied {
            denial: Denial::Capacity(err),
            reason,
        } = outcome
        else {
            panic!("expected capacity denial");
        };
        assert!(reason.contains("none free"), "{reason}");
        assert!(err.alternatives.is_empty());
    }

    #[tokio::test]
    async fn test_queued_pinned_request_redirected_when_resource_goes_offline() {
        let f = fixture(vec![host("H1", 8), host("H2", 8)]).await;
        let hold = f
            .allocator
            .select_and_reserve(AllocationRequest::new(
                Requester::new("vm-1"),
                Requirements::host("x86_64")
                    .pinned_to(id("H1"))
                    .with_slice(ResourceSlice::cores(8)),
            ))
            .await
            .unwrap();
        assert!(hold.reservation().is_some());

        let waiting = AllocationRequest::new(
            Requester::new("vm-2"),
            Requirements::host("x86_64")
                .pinned_to(id("H1"))
                .with_slice(ResourceSlice::cores(4)),
        );
        let waiting_id = waiting.request_id;
        let queued = f.allocator.select_and_reserve(waiting).await.unwrap();
        let AllocationOutcome::Queued { alternatives, .. } = queued else {
            panic!("expected queued");
        };
        assert_eq!(alternatives, vec![id("H2")]);

        f.registry
            .update(&id("H1"), |r| r.status = ResourceStatus::Offline)
            .await;
        let granted = f.allocator.drain_queue().await;

        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].0, waiting_id);
        assert_eq!(granted[0].1.resource_id, id("H2"));
    }

    #[tokio::test]
    async fn test_priority_boost_orders_queue() {
        let group = GroupId::parse("ci").unwrap();
        let f = fixture(vec![board("B1")]).await;
        f.registry
            .upsert_group(ResourceGroup::new(
                group.clone(),
                AllocationPolicy {
                    priority_boost: 5,
                    ..AllocationPolicy::default()
                },
            ))
            .await;

        f.allocator.select_and_reserve(board_request("T0")).await.unwrap();
        f.allocator.select_and_reserve(board_request("plain")).await.unwrap();
        f.allocator
            .select_and_reserve(AllocationRequest::new(
                Requester::new("boosted"),
                Requirements::board().in_group(group),
            ))
            .await
            .unwrap();

        let order: Vec<String> = f
            .allocator
            .queued()
            .await
            .into_iter()
            .map(|q| q.requester.id)
            .collect();
        assert_eq!(order, vec!["boosted", "plain"]);
    }

    #[tokio::test]
    async fn test_withdraw() {
        let f = fixture(vec![board("B1")]).await;
        f.allocator.select_and_reserve(board_request("T1")).await.unwrap();
        let req = board_request("T2");
        let req_id = req.request_id;
        f.allocator.select_and_reserve(req).await.unwrap();

        assert!(f.allocator.withdraw(&req_id).await);
        assert!(!f.allocator.withdraw(&req_id).await);
        assert_eq!(f.allocator.request_status(&req_id).await, RequestStatus::Unknown);
    }
}
