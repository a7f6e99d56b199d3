//! Power/recovery controller.
//!
//! Runs one power cycle: off, wait, on, then poll the board until it answers
//! or the responsiveness timeout runs out. The first failing step aborts the
//! sequence and is reported. The controller never retries; whether to try
//! again is the health monitor's call.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use testfarm_id::ResourceId;
use tokio::time::Instant;
use tracing::{error, info, instrument};

use crate::connector::{PowerAction, PowerSwitch, ResourceProber};
use crate::error::RecoveryFailure;
use crate::model::Resource;

/// Steps of a power cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerStep {
    PowerOff,
    Wait,
    PowerOn,
    AwaitResponsive,
}

impl std::fmt::Display for PowerStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::PowerOff => "power_off",
            Self::Wait => "wait",
            Self::PowerOn => "power_on",
            Self::AwaitResponsive => "await_responsive",
        })
    }
}

/// Outcome of a power cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerResult {
    pub board_id: ResourceId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<PowerStep>,
    pub detail: String,
    pub elapsed_ms: u64,
}

impl PowerResult {
    /// The failure as a typed error, `None` on success.
    pub fn failure(&self) -> Option<RecoveryFailure> {
        (!self.success).then(|| RecoveryFailure {
            resource_id: self.board_id.clone(),
            failed_step: self.failed_step,
            detail: self.detail.clone(),
        })
    }
}

/// Timing of the responsiveness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerTimings {
    pub poll_interval: Duration,
    pub responsive_timeout: Duration,
    pub probe_timeout: Duration,
}

pub struct PowerController {
    switch: Arc<dyn PowerSwitch>,
    prober: Arc<dyn ResourceProber>,
    timings: PowerTimings,
}

impl PowerController {
    pub fn new(switch: Arc<dyn PowerSwitch>, prober: Arc<dyn ResourceProber>, timings: PowerTimings) -> Self {
        Self {
            switch,
            prober,
            timings,
        }
    }

    /// Power-cycle a board.
    #[instrument(skip(self, board), fields(resource_id = %board.id))]
    pub async fn power_cycle(&self, board: &Resource, delay: Duration) -> PowerResult {
        let started = Instant::now();
        let finish = |failed_step: Option<PowerStep>, detail: String| {
            let result = PowerResult {
                board_id: board.id.clone(),
                success: failed_step.is_none(),
                failed_step,
                detail,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            match result.failed_step {
                None => info!(elapsed_ms = result.elapsed_ms, "Power cycle succeeded"),
                Some(step) => error!(
                    step = %step,
                    detail = %result.detail,
                    elapsed_ms = result.elapsed_ms,
                    "Power cycle failed"
                ),
            }
            result
        };

        if board.power_control().is_none() {
            return finish(
                Some(PowerStep::PowerOff),
                "no power control configured".to_string(),
            );
        }

        info!(step = %PowerStep::PowerOff, "Power cycle step");
        if let Err(e) = self.switch.power_action(board, PowerAction::Off).await {
            return finish(Some(PowerStep::PowerOff), e.to_string());
        }

        info!(step = %PowerStep::Wait, delay_ms = delay.as_millis() as u64, "Power cycle step");
        tokio::time::sleep(delay).await;

        info!(step = %PowerStep::PowerOn, "Power cycle step");
        if let Err(e) = self.switch.power_action(board, PowerAction::On).await {
            return finish(Some(PowerStep::PowerOn), e.to_string());
        }

        info!(step = %PowerStep::AwaitResponsive, "Power cycle step");
        match self.await_responsive(board).await {
            Ok(()) => finish(None, "board answered after power cycle".to_string()),
            Err(detail) => finish(Some(PowerStep::AwaitResponsive), detail),
        }
    }

    async fn await_responsive(&self, board: &Resource) -> Result<(), String> {
        let mut last_error = String::from("no probe completed");

        let answered = tokio::time::timeout(self.timings.responsive_timeout, async {
            loop {
                match tokio::time::timeout(self.timings.probe_timeout, self.prober.probe(board)).await {
                    Ok(Ok(result)) if result.reachable => return,
                    Ok(Ok(result)) => last_error = format!("not reachable: {}", result.diagnostics.detail),
                    Ok(Err(e)) => last_error = e.to_string(),
                    Err(_) => last_error = "probe timed out".to_string(),
                }
                tokio::time::sleep(self.timings.poll_interval).await;
            }
        })
        .await;

        answered.map_err(|_| {
            format!(
                "no answer within {}s ({last_error})",
                self.timings.responsive_timeout.as_secs_f32()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockFleet;
    use crate::model::{BoardSpec, Capacity, ConnectionInfo, PowerControl, ResourceSpec};

    fn board(power: bool) -> Resource {
        Resource::new(
            ResourceId::parse("B2").unwrap(),
            ResourceSpec::Board(BoardSpec {
                board_type: "rpi4".to_string(),
                power_control: power.then(|| PowerControl::Relay {
                    device: "relay0".to_string(),
                    channel: 2,
                }),
                ..BoardSpec::default()
            }),
            Capacity::default(),
            ConnectionInfo::new("b2"),
        )
    }

    fn controller(fleet: &Arc<MockFleet>) -> PowerController {
        PowerController::new(
            fleet.clone(),
            fleet.clone(),
            PowerTimings {
                poll_interval: Duration::from_millis(5),
                responsive_timeout: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn test_cycle_off_wait_on_success() {
        let fleet = Arc::new(MockFleet::new());
        let b = board(true);
        fleet.set_unreachable(&b.id, true);
        fleet.revive_on_power_cycle(&b.id);

        let result = controller(&fleet).power_cycle(&b, Duration::from_millis(1)).await;

        assert!(result.success, "{result:?}");
        assert!(result.failure().is_none());
        assert_eq!(fleet.power_actions(&b.id), vec![PowerAction::Off, PowerAction::On]);
    }

    #[tokio::test]
    async fn test_unresponsive_board_fails_at_last_step() {
        let fleet = Arc::new(MockFleet::new());
        let b = board(true);
        fleet.set_unreachable(&b.id, true);

        let result = controller(&fleet).power_cycle(&b, Duration::from_millis(1)).await;

        assert!(!result.success);
        assert_eq!(result.failed_step, Some(PowerStep::AwaitResponsive));
        assert!(result.detail.contains("connection refused"), "{}", result.detail);
    }

    #[tokio::test]
    async fn test_relay_failure_aborts_sequence() {
        let fleet = Arc::new(MockFleet::new());
        let b = board(true);
        fleet.fail_power(&b.id, PowerAction::Off);

        let result = controller(&fleet).power_cycle(&b, Duration::from_millis(1)).await;

        assert_eq!(result.failed_step, Some(PowerStep::PowerOff));
        // Never switched back on, never retried.
        assert_eq!(fleet.power_actions(&b.id), vec![PowerAction::Off]);
        assert_eq!(
            result.failure().unwrap().failed_step,
            Some(PowerStep::PowerOff)
        );
    }

    #[tokio::test]
    async fn test_board_without_power_control() {
        let fleet = Arc::new(MockFleet::new());
        let result = controller(&fleet)
            .power_cycle(&board(false), Duration::from_millis(1))
            .await;
        assert!(!result.success);
        assert!(fleet.actions().is_empty());
    }
}
