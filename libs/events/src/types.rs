//! Status vocabulary and event payloads.
//!
//! The enums here are the shared language between the engine and its
//! consumers; the payload structs are what ends up inside
//! [`EventEnvelope::payload`](crate::EventEnvelope).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testfarm_id::{GroupId, PipelineId, RequestId, ReservationId, ResourceId};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Resource lifecycle
    pub const RESOURCE_REGISTERED: &str = "resource.registered";
    pub const RESOURCE_DECOMMISSIONED: &str = "resource.decommissioned";
    pub const RESOURCE_STATUS_CHANGED: &str = "resource.status_changed";
    pub const RESOURCE_MAINTENANCE_CHANGED: &str = "resource.maintenance_changed";
    pub const RESOURCE_INTERVENTION_CLEARED: &str = "resource.intervention_cleared";
    pub const RESOURCE_GROUP_ASSIGNED: &str = "resource.group_assigned";

    // Recovery
    pub const RECOVERY_STARTED: &str = "recovery.started";
    pub const RECOVERY_SUCCEEDED: &str = "recovery.succeeded";
    pub const RECOVERY_FAILED: &str = "recovery.failed";

    // Firmware flashing
    pub const FLASH_STARTED: &str = "flash.started";
    pub const FLASH_COMPLETED: &str = "flash.completed";
    pub const FLASH_FAILED: &str = "flash.failed";

    // Reservations
    pub const RESERVATION_GRANTED: &str = "reservation.granted";
    pub const RESERVATION_RELEASED: &str = "reservation.released";
    pub const RESERVATION_EXPIRED: &str = "reservation.expired";

    // Allocation requests
    pub const ALLOCATION_QUEUED: &str = "allocation.queued";
    pub const ALLOCATION_DENIED: &str = "allocation.denied";
    pub const ALLOCATION_GRANTED_FROM_QUEUE: &str = "allocation.granted_from_queue";

    // Policy audit
    pub const POLICY_DECISION: &str = "policy.decision";

    // Pipelines
    pub const PIPELINE_CREATED: &str = "pipeline.created";
    pub const PIPELINE_STAGE_CHANGED: &str = "pipeline.stage_changed";
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    pub const PIPELINE_CANCELLED: &str = "pipeline.cancelled";
    pub const PIPELINE_RETRIED: &str = "pipeline.retried";
}

// =============================================================================
// Status Enums
// =============================================================================

/// The three families of managed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    BuildServer,
    Host,
    Board,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::BuildServer, Self::Host, Self::Board];

    /// The status a healthy, unreserved resource of this kind settles in.
    pub fn idle_status(&self) -> ResourceStatus {
        match self {
            Self::BuildServer | Self::Host => ResourceStatus::Online,
            Self::Board => ResourceStatus::Available,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildServer => "build_server",
            Self::Host => "host",
            Self::Board => "board",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource status.
///
/// `Available`, `InUse`, `Flashing` and `Recovery` only apply to boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Unknown,
    Online,
    Degraded,
    Offline,
    Maintenance,
    Available,
    InUse,
    Flashing,
    Recovery,
}

impl ResourceStatus {
    /// Statuses from which new work may be placed on a resource of `kind`.
    pub fn is_allocatable(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::BuildServer | ResourceKind::Host => matches!(self, Self::Online),
            ResourceKind::Board => matches!(self, Self::Available),
        }
    }

    /// Healthy statuses: the resource answered its last probe without warnings.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Online | Self::Available | Self::InUse)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
            Self::Available => "available",
            Self::InUse => "in_use",
            Self::Flashing => "flashing",
            Self::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ok,
    Degraded,
    Unreachable,
}

/// Event severity. Decides which delivery channels receive an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

/// External delivery channels for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Dashboard,
    Webhook,
    Email,
}

impl Severity {
    /// Default routing: everything reaches the dashboard, warnings also go
    /// to webhooks, critical events page by email as well.
    pub fn channels(&self) -> Vec<Channel> {
        match self {
            Severity::Info => vec![Channel::Dashboard],
            Severity::Warning => vec![Channel::Dashboard, Channel::Webhook],
            Severity::Critical => vec![Channel::Dashboard, Channel::Webhook, Channel::Email],
        }
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Build,
    Deploy,
    Boot,
    Test,
}

impl StageKind {
    /// Stages in execution order.
    pub const ALL: [StageKind; 4] = [Self::Build, Self::Deploy, Self::Boot, Self::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Boot => "boot",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

/// Payload for `resource.status_changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatusChangedPayload {
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub old_status: ResourceStatus,
    pub new_status: ResourceStatus,
    pub reason: String,
    #[serde(default)]
    pub needs_intervention: bool,
}

/// Payload for `resource.registered`, `resource.decommissioned` and
/// `resource.group_assigned`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLifecyclePayload {
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
}

/// Payload for `resource.maintenance_changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceChangedPayload {
    pub resource_id: ResourceId,
    pub maintenance_mode: bool,
}

/// Payload for `recovery.*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPayload {
    pub resource_id: ResourceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub detail: String,
}

/// Payload for `flash.*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashPayload {
    pub resource_id: ResourceId,
    pub firmware_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload for `reservation.granted`, `reservation.released` and
/// `reservation.expired`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationPayload {
    pub reservation_id: ReservationId,
    pub resource_id: ResourceId,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Payload for `allocation.*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPayload {
    pub request_id: RequestId,
    pub kind: ResourceKind,
    pub requester: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<u64>,
}

/// Payload for `policy.decision` (audit trail of every authorization).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecisionPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub requester: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    pub allowed: bool,
    pub rule: String,
    pub detail: String,
}

/// Payload for `pipeline.*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePayload {
    pub pipeline_id: PipelineId,
    pub status: PipelineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_status: Option<StageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocatable_statuses_per_kind() {
        assert!(ResourceStatus::Online.is_allocatable(ResourceKind::Host));
        assert!(ResourceStatus::Online.is_allocatable(ResourceKind::BuildServer));
        assert!(!ResourceStatus::Online.is_allocatable(ResourceKind::Board));
        assert!(ResourceStatus::Available.is_allocatable(ResourceKind::Board));
        assert!(!ResourceStatus::InUse.is_allocatable(ResourceKind::Board));
        assert!(!ResourceStatus::Degraded.is_allocatable(ResourceKind::Host));
        assert!(!ResourceStatus::Maintenance.is_allocatable(ResourceKind::Host));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ResourceStatus::InUse).unwrap();
        assert_eq!(json, "\"in_use\"");
        let kind: ResourceKind = serde_json::from_str("\"build_server\"").unwrap();
        assert_eq!(kind, ResourceKind::BuildServer);
    }

    #[test]
    fn test_severity_routing() {
        assert_eq!(Severity::Info.channels(), vec![Channel::Dashboard]);
        assert!(Severity::Critical.channels().contains(&Channel::Email));
        assert!(!Severity::Warning.channels().contains(&Channel::Email));
    }

    #[test]
    fn test_stage_order() {
        assert!(StageKind::Build < StageKind::Deploy);
        assert!(StageKind::Boot < StageKind::Test);
    }

    #[test]
    fn test_pipeline_terminal_statuses() {
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(PipelineStatus::Cancelled.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
    }
}
