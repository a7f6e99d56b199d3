//! Engine error types.
//!
//! Resource-level failures are typed values callers can branch on; only
//! [`EngineError::Fatal`] means the process should stop.

use serde::{Deserialize, Serialize};
use testfarm_events::StageKind;
use testfarm_id::{GroupId, PipelineId, ReservationId, ResourceId};
use thiserror::Error;

use crate::connector::ConnectorError;
use crate::policy::PolicyRule;
use crate::power::PowerStep;

/// A connector call failed (probe, power action, flash, remote command).
#[derive(Debug, Error)]
#[error("resource {resource_id} unreachable: {source}")]
pub struct ConnectivityError {
    pub resource_id: ResourceId,
    #[source]
    pub source: ConnectorError,
}

/// A reservation could not be granted for lack of capacity.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("capacity unavailable: {reason}")]
pub struct CapacityError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,
    pub reason: String,
    #[serde(default)]
    pub alternatives: Vec<ResourceId>,
}

/// A group policy rule rejected the request.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("denied by {rule} rule of group {group_id}: {reason}")]
pub struct PolicyDenied {
    pub group_id: GroupId,
    pub rule: PolicyRule,
    pub reason: String,
}

/// An automatic or manual power cycle did not bring the board back.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("recovery of {resource_id} failed{}: {detail}", failed_step.map(|s| format!(" at {s}")).unwrap_or_default())]
pub struct RecoveryFailure {
    pub resource_id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<PowerStep>,
    pub detail: String,
}

/// A pipeline stage failed for good.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("pipeline {pipeline_id} failed at {stage}: {reason}")]
pub struct PipelineStageFailure {
    pub pipeline_id: PipelineId,
    pub stage: StageKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,
    /// The stage already retried once on an alternative resource.
    #[serde(default)]
    pub alternative_attempted: bool,
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),

    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    PolicyDenied(#[from] PolicyDenied),

    #[error(transparent)]
    Recovery(#[from] RecoveryFailure),

    #[error(transparent)]
    PipelineStage(#[from] PipelineStageFailure),

    /// Internal bookkeeping no longer adds up.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether the process should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
