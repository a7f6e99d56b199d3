//! Stage execution.
//!
//! The sequencer decides which resource a stage runs on; a
//! [`StageExecutor`] does the work there. [`CommandStageExecutor`] runs one
//! remote command per stage, [`ScriptedExecutor`] is a scriptable stand-in
//! for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use testfarm_events::StageKind;
use testfarm_id::{PipelineId, ResourceId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::connector::RemoteExecutor;
use crate::model::{Resource, StageOutput};

/// Everything a stage needs to run.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub stage: StageKind,
    /// 1 for the first try, 2 on the alternative resource.
    pub attempt: u32,
    pub resource: Resource,
    /// Outputs of the stages completed so far.
    pub previous_outputs: BTreeMap<StageKind, StageOutput>,
}

/// A stage did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct StageFailure {
    pub reason: String,
    /// Caused by the resource itself (unreachable, lost), so another
    /// resource might succeed.
    pub resource_specific: bool,
}

impl StageFailure {
    pub fn resource(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            resource_specific: true,
        }
    }

    pub fn job(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            resource_specific: false,
        }
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageFailure>;
}

/// Runs a configured command per stage through the remote executor.
///
/// Stages without a command succeed without doing anything.
pub struct CommandStageExecutor {
    remote: Arc<dyn RemoteExecutor>,
    commands: BTreeMap<StageKind, String>,
}

impl CommandStageExecutor {
    pub fn new(remote: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            remote,
            commands: BTreeMap::new(),
        }
    }

    pub fn with_command(mut self, stage: StageKind, command: impl Into<String>) -> Self {
        self.commands.insert(stage, command.into());
        self
    }
}

#[async_trait]
impl StageExecutor for CommandStageExecutor {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageFailure> {
        let Some(command) = self.commands.get(&ctx.stage) else {
            debug!(stage = %ctx.stage, "No command configured for stage");
            return Ok(StageOutput::default());
        };

        let output = self
            .remote
            .execute_remote(&ctx.resource, command)
            .await
            .map_err(|e| StageFailure::resource(format!("{}: {e}", ctx.resource.id)))?;

        if !output.success() {
            warn!(
                stage = %ctx.stage,
                resource_id = %ctx.resource.id,
                exit_code = output.exit_code,
                "Stage command failed"
            );
            return Err(StageFailure::job(format!(
                "`{command}` exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(StageOutput {
            output_ref: Some(format!("{}/{}", ctx.pipeline_id, ctx.stage)),
            artifacts: Vec::new(),
            log_ref: output
                .stdout
                .lines()
                .last()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty()),
        })
    }
}

#[derive(Debug, Default)]
struct Script {
    on_resource: HashMap<(StageKind, ResourceId), StageFailure>,
    once: HashMap<StageKind, VecDeque<StageFailure>>,
    delays: HashMap<StageKind, Duration>,
    calls: Vec<(StageKind, ResourceId)>,
}

/// Scriptable executor for tests and local runs.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<Script>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut script)
    }

    /// `stage` fails every time it runs on `resource`.
    pub fn fail_on(&self, stage: StageKind, resource: &ResourceId, failure: StageFailure) {
        self.with_script(|s| {
            s.on_resource.insert((stage, resource.clone()), failure);
        });
    }

    /// The next run of `stage` fails, wherever it runs.
    pub fn fail_once(&self, stage: StageKind, failure: StageFailure) {
        self.with_script(|s| s.once.entry(stage).or_default().push_back(failure));
    }

    /// `stage` takes `delay` before answering.
    pub fn delay(&self, stage: StageKind, delay: Duration) {
        self.with_script(|s| {
            s.delays.insert(stage, delay);
        });
    }

    /// Stages run so far and where.
    pub fn calls(&self) -> Vec<(StageKind, ResourceId)> {
        self.with_script(|s| s.calls.clone())
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageFailure> {
        let delay = self.with_script(|s| {
            s.calls.push((ctx.stage, ctx.resource.id.clone()));
            s.delays.get(&ctx.stage).copied()
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with_script(|s| {
            if let Some(failure) = s.on_resource.get(&(ctx.stage, ctx.resource.id.clone())) {
                return Err(failure.clone());
            }
            if let Some(failure) = s.once.get_mut(&ctx.stage).and_then(|q| q.pop_front()) {
                return Err(failure);
            }
            Ok(StageOutput {
                output_ref: Some(format!("{}-{}", ctx.stage, ctx.resource.id)),
                artifacts: vec![format!("{}.log", ctx.stage)],
                log_ref: None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockFleet;
    use crate::model::{BuildServerSpec, Capacity, ConnectionInfo, ResourceSpec};

    fn ctx(stage: StageKind) -> StageContext {
        StageContext {
            pipeline_id: PipelineId::new(),
            pipeline_name: "kernel-ci".to_string(),
            stage,
            attempt: 1,
            resource: Resource::new(
                ResourceId::parse("S1").unwrap(),
                ResourceSpec::BuildServer(BuildServerSpec {
                    toolchains: ["gcc-13".to_string()].into(),
                    max_concurrent_jobs: 2,
                }),
                Capacity::default(),
                ConnectionInfo::new("s1"),
            ),
            previous_outputs: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_command_exit_code_is_job_failure() {
        let fleet = Arc::new(MockFleet::new());
        fleet.set_command_exit("make -j8", 2);
        let executor = CommandStageExecutor::new(fleet).with_command(StageKind::Build, "make -j8");

        let err = executor.execute(&ctx(StageKind::Build)).await.unwrap_err();
        assert!(!err.resource_specific);
        assert!(err.reason.contains("exited with 2"));
    }

    #[tokio::test]
    async fn test_unreachable_resource_is_resource_specific() {
        let fleet = Arc::new(MockFleet::new());
        let c = ctx(StageKind::Build);
        fleet.set_unreachable(&c.resource.id, true);
        let executor = CommandStageExecutor::new(fleet).with_command(StageKind::Build, "make");

        let err = executor.execute(&c).await.unwrap_err();
        assert!(err.resource_specific);
    }

    #[tokio::test]
    async fn test_stage_without_command_succeeds() {
        let executor = CommandStageExecutor::new(Arc::new(MockFleet::new()));
        let output = executor.execute(&ctx(StageKind::Boot)).await.unwrap();
        assert_eq!(output, StageOutput::default());
    }

    #[tokio::test]
    async fn test_scripted_fail_once() {
        let executor = ScriptedExecutor::new();
        executor.fail_once(StageKind::Test, StageFailure::job("assertion failed"));

        assert!(executor.execute(&ctx(StageKind::Test)).await.is_err());
        assert!(executor.execute(&ctx(StageKind::Test)).await.is_ok());
        assert_eq!(executor.calls().len(), 2);
    }
}
