//! Connector interfaces to the outside world.
//!
//! The engine never speaks SSH, libvirt, PDU or serial protocols itself. It
//! calls these narrow traits, implemented by external collaborators:
//! - [`ResourceProber`]: health probes (used by the health monitor)
//! - [`PowerSwitch`]: board power on/off (used by the power controller)
//! - [`BoardFlasher`]: firmware flashing (gates the `Flashing` status)
//! - [`RemoteExecutor`]: command execution for build/provisioning callers
//!
//! [`MockFleet`] implements all of them for tests and development.

mod mock;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Resource, Utilization};

pub use mock::{FleetAction, MockFleet};

/// Failure talking to a resource or its control hardware.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("connection refused")]
    Refused,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Probe diagnostics beyond the raw metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Warnings that make an answering resource degraded
    /// (e.g. serial console flapping).
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub detail: String,
}

/// Answer to a single probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub reachable: bool,
    pub metrics: Utilization,
    pub diagnostics: Diagnostics,
}

impl ProbeResult {
    pub fn healthy(metrics: Utilization) -> Self {
        Self {
            reachable: true,
            metrics,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            metrics: Utilization::default(),
            diagnostics: Diagnostics {
                warnings: Vec::new(),
                detail: detail.into(),
            },
        }
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    On,
    Off,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerAction::On => f.write_str("on"),
            PowerAction::Off => f.write_str("off"),
        }
    }
}

/// One progress report from a firmware flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashProgress {
    pub percent: u8,
    pub phase: String,
}

/// Progress reports until the flash ends; an `Err` item ends it in failure.
pub type FlashStream = BoxStream<'static, Result<FlashProgress, ConnectorError>>;

/// Health probe connector.
#[async_trait]
pub trait ResourceProber: Send + Sync {
    /// Probe a resource once. `Err` and `reachable == false` both count as a miss.
    async fn probe(&self, resource: &Resource) -> Result<ProbeResult, ConnectorError>;
}

/// Generic remote command execution.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute_remote(
        &self,
        resource: &Resource,
        command: &str,
    ) -> Result<CommandOutput, ConnectorError>;
}

/// Board power control.
#[async_trait]
pub trait PowerSwitch: Send + Sync {
    async fn power_action(&self, board: &Resource, action: PowerAction) -> Result<(), ConnectorError>;
}

/// Board firmware flashing.
#[async_trait]
pub trait BoardFlasher: Send + Sync {
    async fn flash(&self, board: &Resource, firmware_ref: &str) -> Result<FlashStream, ConnectorError>;
}
