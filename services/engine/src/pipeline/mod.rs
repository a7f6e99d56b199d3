//! Build, deploy, boot and test pipelines.

pub mod executor;
pub mod sequencer;

pub use executor::{CommandStageExecutor, ScriptedExecutor, StageContext, StageExecutor, StageFailure};
pub use sequencer::{PipelineConfig, PipelineSequencer};
