//! Scriptable in-memory fleet implementing every connector trait.
//!
//! Used by tests and by the binary until real connectors are wired in.
//! Power is simulated: a board switched off stops answering probes, and a
//! board marked with [`MockFleet::revive_on_power_cycle`] answers again once
//! switched back on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use testfarm_id::ResourceId;
use tracing::{debug, info};

use super::{
    BoardFlasher, CommandOutput, ConnectorError, Diagnostics, FlashProgress, FlashStream,
    PowerAction, PowerSwitch, ProbeResult, RemoteExecutor, ResourceProber,
};
use crate::model::{Resource, Utilization};

/// Connector call recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetAction {
    Probe(ResourceId),
    Power(ResourceId, PowerAction),
    Flash(ResourceId, String),
    Execute(ResourceId, String),
}

#[derive(Debug, Default)]
struct FleetState {
    unreachable: BTreeSet<ResourceId>,
    powered_off: BTreeSet<ResourceId>,
    revive_on_cycle: BTreeSet<ResourceId>,
    metrics: BTreeMap<ResourceId, Utilization>,
    warnings: BTreeMap<ResourceId, Vec<String>>,
    probe_delay: BTreeMap<ResourceId, Duration>,
    power_failures: BTreeMap<ResourceId, PowerAction>,
    flash_failures: BTreeMap<ResourceId, String>,
    command_exit: BTreeMap<String, i32>,
    actions: Vec<FleetAction>,
}

/// Mock fleet for testing and development.
#[derive(Debug, Default)]
pub struct MockFleet {
    state: Mutex<FleetState>,
}

impl MockFleet {
    /// A fleet where everything answers.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FleetState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Make probes (and remote commands) on `id` fail or succeed.
    pub fn set_unreachable(&self, id: &ResourceId, unreachable: bool) {
        self.with_state(|s| {
            if unreachable {
                s.unreachable.insert(id.clone());
            } else {
                s.unreachable.remove(id);
            }
        });
    }

    pub fn set_metrics(&self, id: &ResourceId, metrics: Utilization) {
        self.with_state(|s| {
            s.metrics.insert(id.clone(), metrics);
        });
    }

    pub fn set_warnings(&self, id: &ResourceId, warnings: Vec<String>) {
        self.with_state(|s| {
            s.warnings.insert(id.clone(), warnings);
        });
    }

    /// Delay every probe of `id`.
    pub fn set_probe_delay(&self, id: &ResourceId, delay: Duration) {
        self.with_state(|s| {
            s.probe_delay.insert(id.clone(), delay);
        });
    }

    /// An unreachable board comes back after it is switched off and on.
    pub fn revive_on_power_cycle(&self, id: &ResourceId) {
        self.with_state(|s| {
            s.revive_on_cycle.insert(id.clone());
        });
    }

    /// Make one power action on `id` fail (the relay/PDU does not answer).
    pub fn fail_power(&self, id: &ResourceId, action: PowerAction) {
        self.with_state(|s| {
            s.power_failures.insert(id.clone(), action);
        });
    }

    /// Make flashing `id` fail half way with `error`.
    pub fn fail_flash(&self, id: &ResourceId, error: impl Into<String>) {
        self.with_state(|s| {
            s.flash_failures.insert(id.clone(), error.into());
        });
    }

    /// Exit code returned for `command` (default 0).
    pub fn set_command_exit(&self, command: impl Into<String>, exit_code: i32) {
        self.with_state(|s| {
            s.command_exit.insert(command.into(), exit_code);
        });
    }

    /// All connector calls so far.
    pub fn actions(&self) -> Vec<FleetAction> {
        self.with_state(|s| s.actions.clone())
    }

    /// Power actions issued for `id`, in order.
    pub fn power_actions(&self, id: &ResourceId) -> Vec<PowerAction> {
        self.with_state(|s| {
            s.actions
                .iter()
                .filter_map(|a| match a {
                    FleetAction::Power(target, action) if target == id => Some(*action),
                    _ => None,
                })
                .collect()
        })
    }

    fn answers(state: &FleetState, id: &ResourceId) -> bool {
        !state.unreachable.contains(id) && !state.powered_off.contains(id)
    }
}

#[async_trait]
impl ResourceProber for MockFleet {
    async fn probe(&self, resource: &Resource) -> Result<ProbeResult, ConnectorError> {
        let delay = self.with_state(|s| {
            s.actions.push(FleetAction::Probe(resource.id.clone()));
            s.probe_delay.get(&resource.id).copied()
        });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with_state(|s| {
            if !Self::answers(s, &resource.id) {
                debug!(resource_id = %resource.id, "[MOCK] Probe refused");
                return Err(ConnectorError::Refused);
            }

            Ok(ProbeResult {
                reachable: true,
                metrics: s.metrics.get(&resource.id).cloned().unwrap_or_default(),
                diagnostics: Diagnostics {
                    warnings: s.warnings.get(&resource.id).cloned().unwrap_or_default(),
                    detail: format!("[MOCK] {} answered", resource.connection.address),
                },
            })
        })
    }
}

#[async_trait]
impl PowerSwitch for MockFleet {
    async fn power_action(&self, board: &Resource, action: PowerAction) -> Result<(), ConnectorError> {
        self.with_state(|s| {
            s.actions.push(FleetAction::Power(board.id.clone(), action));

            if s.power_failures.get(&board.id) == Some(&action) {
                return Err(ConnectorError::Unreachable(format!(
                    "power controller for {} did not answer",
                    board.id
                )));
            }

            match action {
                PowerAction::Off => {
                    s.powered_off.insert(board.id.clone());
                }
                PowerAction::On => {
                    s.powered_off.remove(&board.id);
                    if s.revive_on_cycle.remove(&board.id) {
                        s.unreachable.remove(&board.id);
                    }
                }
            }

            info!(resource_id = %board.id, action = %action, "[MOCK] Power action");
            Ok(())
        })
    }
}

#[async_trait]
impl BoardFlasher for MockFleet {
    async fn flash(&self, board: &Resource, firmware_ref: &str) -> Result<FlashStream, ConnectorError> {
        let failure = self.with_state(|s| {
            s.actions
                .push(FleetAction::Flash(board.id.clone(), firmware_ref.to_string()));
            if Self::answers(s, &board.id) {
                Ok(s.flash_failures.get(&board.id).cloned())
            } else {
                Err(ConnectorError::Refused)
            }
        })?;

        let mut steps: Vec<Result<FlashProgress, ConnectorError>> = vec![
            Ok(FlashProgress {
                percent: 0,
                phase: "erase".to_string(),
            }),
            Ok(FlashProgress {
                percent: 50,
                phase: "write".to_string(),
            }),
        ];
        match failure {
            Some(error) => steps.push(Err(ConnectorError::Other(error))),
            None => steps.push(Ok(FlashProgress {
                percent: 100,
                phase: "verify".to_string(),
            })),
        }

        Ok(stream::iter(steps).boxed())
    }
}

#[async_trait]
impl RemoteExecutor for MockFleet {
    async fn execute_remote(
        &self,
        resource: &Resource,
        command: &str,
    ) -> Result<CommandOutput, ConnectorError> {
        self.with_state(|s| {
            s.actions
                .push(FleetAction::Execute(resource.id.clone(), command.to_string()));

            if !Self::answers(s, &resource.id) {
                return Err(ConnectorError::Refused);
            }

            let exit_code = s.command_exit.get(command).copied().unwrap_or(0);
            Ok(CommandOutput {
                exit_code,
                stdout: format!("[MOCK] {command}"),
                stderr: String::new(),
            })
        })
    }
}
