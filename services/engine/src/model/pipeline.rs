//! Pipeline runs and their stages.
//!
//! All stage transitions go through [`PipelineRun`] methods so the ordering
//! rules hold no matter who drives the run:
//!
//! - a stage leaves `Pending` only after every earlier stage is `Completed`
//! - a failed stage skips everything after it and ends the run
//! - outputs of completed stages are never cleared by a failure

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testfarm_events::{PipelineStatus, StageKind, StageStatus};
use testfarm_id::{PipelineId, ReservationId, ResourceId};

use crate::error::{EngineError, PipelineStageFailure};

/// What a stage produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Primary output (image reference, VM name, test report id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_ref: Option<String>,
}

/// One execution of a stage against one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: Vec<StageAttempt>,
}

impl Stage {
    fn new(kind: StageKind) -> Self {
        Self {
            kind,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            resource_id: None,
            output: None,
            error: None,
            attempts: Vec::new(),
        }
    }
}

/// A build/deploy/boot/test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: PipelineId,
    pub name: String,
    pub requester: String,
    pub status: PipelineStatus,
    pub stages: Vec<Stage>,
    /// Index of the stage currently running or next to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<usize>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Reservations the run holds right now.
    #[serde(default)]
    pub reservations: Vec<ReservationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PipelineStageFailure>,
    #[serde(default)]
    pub retries: u32,
}

impl PipelineRun {
    pub fn new(
        id: PipelineId,
        name: impl Into<String>,
        requester: impl Into<String>,
        kinds: &[StageKind],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            requester: requester.into(),
            status: PipelineStatus::Pending,
            stages: kinds.iter().copied().map(Stage::new).collect(),
            current_stage: if kinds.is_empty() { None } else { Some(0) },
            created_at: now,
            finished_at: None,
            reservations: Vec::new(),
            failure: None,
            retries: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn stage_index(&self, kind: StageKind) -> Option<usize> {
        self.stages.iter().position(|s| s.kind == kind)
    }

    pub fn failed_stage(&self) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.status == StageStatus::Failed)
    }

    /// Outputs of every completed stage, kept across failures and retries.
    pub fn outputs(&self) -> BTreeMap<StageKind, StageOutput> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .filter_map(|s| s.output.clone().map(|o| (s.kind, o)))
            .collect()
    }

    /// `Pending -> Running` for stage `index`.
    pub fn start_stage(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.ensure_active()?;
        if let Some(blocking) = self.stages[..index.min(self.stages.len())]
            .iter()
            .find(|s| s.status != StageStatus::Completed)
        {
            return Err(EngineError::InvalidState(format!(
                "stage {} is {:?}, earlier stages must complete first",
                blocking.kind, blocking.status
            )));
        }

        let stage = self.stage_mut(index)?;
        if stage.status != StageStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "stage {} is {:?}, expected pending",
                stage.kind, stage.status
            )));
        }

        stage.status = StageStatus::Running;
        stage.started_at = Some(now);
        self.status = PipelineStatus::Running;
        self.current_stage = Some(index);
        Ok(())
    }

    /// Record which resource the running stage executes on.
    pub fn assign_resource(&mut self, index: usize, resource_id: ResourceId) -> Result<(), EngineError> {
        let stage = self.running_stage_mut(index)?;
        stage.resource_id = Some(resource_id);
        Ok(())
    }

    /// Record a failed attempt that will be retried on another resource.
    pub fn record_failed_attempt(
        &mut self,
        index: usize,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let stage = self.running_stage_mut(index)?;
        let attempt = StageAttempt {
            resource_id: stage.resource_id.take(),
            finished_at: now,
            error: Some(error.into()),
        };
        stage.attempts.push(attempt);
        Ok(())
    }

    /// `Running -> Completed`. Completing the last stage completes the run.
    pub fn complete_stage(
        &mut self,
        index: usize,
        output: StageOutput,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let stage = self.running_stage_mut(index)?;
        stage.attempts.push(StageAttempt {
            resource_id: stage.resource_id.clone(),
            finished_at: now,
            error: None,
        });
        stage.status = StageStatus::Completed;
        stage.finished_at = Some(now);
        stage.output = Some(output);

        if index + 1 == self.stages.len() {
            self.status = PipelineStatus::Completed;
            self.finished_at = Some(now);
            self.current_stage = None;
        } else {
            self.current_stage = Some(index + 1);
        }
        Ok(())
    }

    /// Fail stage `index`: later stages are skipped and the run ends.
    ///
    /// The stage may be `Pending` (it could not acquire a resource) or
    /// `Running`.
    pub fn fail_stage(
        &mut self,
        index: usize,
        failure: PipelineStageFailure,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.ensure_active()?;
        let stage = self.stage_mut(index)?;
        if !matches!(stage.status, StageStatus::Pending | StageStatus::Running) {
            return Err(EngineError::InvalidState(format!(
                "stage {} is {:?}, cannot fail it",
                stage.kind, stage.status
            )));
        }

        stage.attempts.push(StageAttempt {
            resource_id: stage.resource_id.clone(),
            finished_at: now,
            error: Some(failure.reason.clone()),
        });
        stage.status = StageStatus::Failed;
        stage.started_at.get_or_insert(now);
        stage.finished_at = Some(now);
        stage.error = Some(failure.reason.clone());

        for later in &mut self.stages[index + 1..] {
            later.status = StageStatus::Skipped;
        }

        self.status = PipelineStatus::Failed;
        self.finished_at = Some(now);
        self.current_stage = Some(index);
        self.failure = Some(failure);
        Ok(())
    }

    /// Cancel a non-terminal run.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.ensure_active()?;
        for stage in &mut self.stages {
            match stage.status {
                StageStatus::Running => {
                    stage.status = StageStatus::Cancelled;
                    stage.finished_at = Some(now);
                }
                StageStatus::Pending => stage.status = StageStatus::Skipped,
                _ => {}
            }
        }
        self.status = PipelineStatus::Cancelled;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Re-open a failed run from its failed stage.
    ///
    /// Only allowed on a `Failed` run and only for the stage that failed;
    /// completed stages before it keep their outputs.
    pub fn reset_from(&mut self, kind: StageKind) -> Result<usize, EngineError> {
        if self.status != PipelineStatus::Failed {
            return Err(EngineError::InvalidState(format!(
                "pipeline {} is {:?}, only failed pipelines can be retried",
                self.id, self.status
            )));
        }

        let index = self.stage_index(kind).ok_or_else(|| {
            EngineError::InvalidState(format!("pipeline {} has no {} stage", self.id, kind))
        })?;
        if self.stages[index].status != StageStatus::Failed {
            return Err(EngineError::InvalidState(format!(
                "stage {} is {:?}, only the failed stage can be retried",
                kind, self.stages[index].status
            )));
        }

        for stage in &mut self.stages[index..] {
            stage.status = StageStatus::Pending;
            stage.started_at = None;
            stage.finished_at = None;
            stage.resource_id = None;
            stage.output = None;
            stage.error = None;
        }

        self.status = PipelineStatus::Running;
        self.finished_at = None;
        self.failure = None;
        self.current_stage = Some(index);
        self.retries += 1;
        Ok(index)
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "pipeline {} is {:?}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn stage_mut(&mut self, index: usize) -> Result<&mut Stage, EngineError> {
        let id = self.id;
        self.stages
            .get_mut(index)
            .ok_or_else(|| EngineError::InvalidState(format!("pipeline {id} has no stage {index}")))
    }

    fn running_stage_mut(&mut self, index: usize) -> Result<&mut Stage, EngineError> {
        self.ensure_active()?;
        let stage = self.stage_mut(index)?;
        if stage.status != StageStatus::Running {
            return Err(EngineError::InvalidState(format!(
                "stage {} is {:?}, expected running",
                stage.kind, stage.status
            )));
        }
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [StageKind; 4] = [
        StageKind::Build,
        StageKind::Deploy,
        StageKind::Boot,
        StageKind::Test,
    ];

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn run() -> PipelineRun {
        PipelineRun::new(PipelineId::new(), "kernel-ci", "ci", &ALL, ts(0))
    }

    fn failure(run: &PipelineRun, stage: StageKind) -> PipelineStageFailure {
        PipelineStageFailure {
            pipeline_id: run.id,
            stage,
            reason: "host unreachable".to_string(),
            resource_id: None,
            alternative_attempted: true,
        }
    }

    #[test]
    fn test_stage_cannot_start_before_previous_completes() {
        let mut run = run();
        assert!(run.start_stage(1, ts(1)).is_err());

        run.start_stage(0, ts(1)).unwrap();
        assert!(run.start_stage(1, ts(2)).is_err());

        run.complete_stage(0, StageOutput::default(), ts(3)).unwrap();
        run.start_stage(1, ts(3)).unwrap();
        assert_eq!(run.current_stage, Some(1));
        assert_eq!(run.status, PipelineStatus::Running);
    }

    #[test]
    fn test_failure_skips_rest_and_keeps_outputs() {
        let mut run = run();
        run.start_stage(0, ts(1)).unwrap();
        let output = StageOutput {
            output_ref: Some("image-42".to_string()),
            artifacts: vec!["vmlinuz".to_string()],
            log_ref: None,
        };
        run.complete_stage(0, output.clone(), ts(2)).unwrap();
        run.start_stage(1, ts(2)).unwrap();
        let f = failure(&run, StageKind::Deploy);
        run.fail_stage(1, f, ts(3)).unwrap();

        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.stages[1].status, StageStatus::Failed);
        assert_eq!(run.stages[2].status, StageStatus::Skipped);
        assert_eq!(run.stages[3].status, StageStatus::Skipped);
        assert_eq!(run.outputs().get(&StageKind::Build), Some(&output));
        assert!(run.failure.is_some());

        // Terminal: nothing else moves.
        assert!(run.start_stage(2, ts(4)).is_err());
        assert!(run.cancel(ts(4)).is_err());
    }

    #[test]
    fn test_reset_from_failed_stage_only() {
        let mut run = run();
        run.start_stage(0, ts(1)).unwrap();
        run.complete_stage(0, StageOutput::default(), ts(2)).unwrap();
        run.start_stage(1, ts(2)).unwrap();
        let f = failure(&run, StageKind::Deploy);
        run.fail_stage(1, f, ts(3)).unwrap();

        assert!(run.reset_from(StageKind::Build).is_err());
        assert!(run.reset_from(StageKind::Boot).is_err());

        let index = run.reset_from(StageKind::Deploy).unwrap();
        assert_eq!(index, 1);
        assert_eq!(run.status, PipelineStatus::Running);
        assert_eq!(run.stages[0].status, StageStatus::Completed);
        assert!(run.stages[1..]
            .iter()
            .all(|s| s.status == StageStatus::Pending));
        assert_eq!(run.retries, 1);
        // The failed attempt stays in the stage history.
        assert_eq!(run.stages[1].attempts.len(), 1);
    }

    #[test]
    fn test_reset_requires_failed_run() {
        let mut run = run();
        assert!(run.reset_from(StageKind::Build).is_err());
    }

    #[test]
    fn test_cancel_marks_running_and_pending() {
        let mut run = run();
        run.start_stage(0, ts(1)).unwrap();
        run.cancel(ts(2)).unwrap();

        assert_eq!(run.status, PipelineStatus::Cancelled);
        assert_eq!(run.stages[0].status, StageStatus::Cancelled);
        assert!(run.stages[1..]
            .iter()
            .all(|s| s.status == StageStatus::Skipped));
    }

    #[test]
    fn test_alternative_attempt_history() {
        let mut run = run();
        run.start_stage(0, ts(0)).unwrap();
        run.complete_stage(0, StageOutput::default(), ts(1)).unwrap();
        run.start_stage(1, ts(1)).unwrap();
        run.assign_resource(1, ResourceId::parse("H1").unwrap()).unwrap();
        run.record_failed_attempt(1, "unreachable", ts(2)).unwrap();
        run.assign_resource(1, ResourceId::parse("H2").unwrap()).unwrap();
        run.complete_stage(1, StageOutput::default(), ts(3)).unwrap();

        let deploy = &run.stages[1];
        assert_eq!(deploy.attempts.len(), 2);
        assert_eq!(deploy.attempts[0].resource_id.as_ref().unwrap().as_str(), "H1");
        assert_eq!(deploy.resource_id.as_ref().unwrap().as_str(), "H2");
    }
}
