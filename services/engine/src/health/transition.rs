//! Resource status state machine.
//!
//! Pure functions: a probe result is first classified into a
//! [`ProbeOutcome`], then [`next_status`] decides the new status and whether
//! an automatic recovery should start. Nothing here touches the registry.

use testfarm_events::{ProbeOutcome, ResourceKind, ResourceStatus};

use crate::config::HealthThresholds;
use crate::connector::{ConnectorError, ProbeResult};

/// Classified probe with the reasons behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub outcome: ProbeOutcome,
    pub reasons: Vec<String>,
}

/// Turn a raw probe result into ok / degraded / unreachable.
pub fn classify(
    kind: ResourceKind,
    result: &Result<ProbeResult, ConnectorError>,
    thresholds: &HealthThresholds,
) -> Classification {
    let probe = match result {
        Err(e) => {
            return Classification {
                outcome: ProbeOutcome::Unreachable,
                reasons: vec![e.to_string()],
            }
        }
        Ok(probe) if !probe.reachable => {
            return Classification {
                outcome: ProbeOutcome::Unreachable,
                reasons: vec![if probe.diagnostics.detail.is_empty() {
                    "not reachable".to_string()
                } else {
                    probe.diagnostics.detail.clone()
                }],
            }
        }
        Ok(probe) => probe,
    };

    let metrics = &probe.metrics;
    let mut reasons = probe.diagnostics.warnings.clone();

    match kind {
        ResourceKind::BuildServer => {
            if let Some(free) = metrics.disk_free_gb {
                if free < thresholds.min_disk_free_gb {
                    reasons.push(format!(
                        "disk free {free} GB below {} GB",
                        thresholds.min_disk_free_gb
                    ));
                }
            }
        }
        ResourceKind::Host => {
            let busiest = metrics.cpu_percent.max(metrics.memory_percent);
            if busiest > thresholds.max_host_utilization_percent {
                reasons.push(format!(
                    "utilization {busiest:.0}% above {:.0}%",
                    thresholds.max_host_utilization_percent
                ));
            }
        }
        ResourceKind::Board => {
            if let Some(temp) = metrics.temperature_c {
                if temp > thresholds.max_board_temperature_c {
                    reasons.push(format!(
                        "temperature {temp:.1}C above {:.1}C",
                        thresholds.max_board_temperature_c
                    ));
                }
            }
        }
    }

    Classification {
        outcome: if reasons.is_empty() {
            ProbeOutcome::Ok
        } else {
            ProbeOutcome::Degraded
        },
        reasons,
    }
}

/// Everything the state machine looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionInput {
    pub kind: ResourceKind,
    pub status: ResourceStatus,
    pub outcome: ProbeOutcome,
    /// Consecutive misses including this probe.
    pub consecutive_misses: u32,
    pub miss_threshold: u32,
    pub needs_intervention: bool,
    /// Board has power control and its recovery budget is not spent.
    pub recovery_allowed: bool,
    pub reserved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: ResourceStatus,
    pub attempt_recovery: bool,
}

impl Transition {
    fn stay(status: ResourceStatus) -> Self {
        Self {
            status,
            attempt_recovery: false,
        }
    }

    fn to(status: ResourceStatus) -> Self {
        Self::stay(status)
    }
}

/// Status after applying one probe.
///
/// - `Maintenance`, `Flashing` and `Recovery` are held: probes never move
///   a resource out of them
/// - unreachable beyond the miss threshold goes `Offline`; a board with
///   power control and an unspent recovery budget gets one automatic
///   recovery
/// - a resource waiting for a human stays `Offline` whatever probes say
/// - answering resources go to their healthy status, or `Degraded` when a
///   threshold is breached
pub fn next_status(input: TransitionInput) -> Transition {
    use ResourceStatus::*;

    if matches!(input.status, Maintenance | Flashing | Recovery) {
        return Transition::stay(input.status);
    }
    if input.needs_intervention && input.status == Offline {
        return Transition::stay(Offline);
    }

    match input.outcome {
        ProbeOutcome::Unreachable => {
            if input.consecutive_misses <= input.miss_threshold {
                return Transition::stay(input.status);
            }
            // Also covers boards already offline that never had their
            // attempt (a failed flash); a spent budget blocks the retry.
            Transition {
                status: Offline,
                attempt_recovery: input.kind == ResourceKind::Board
                    && input.recovery_allowed
                    && !input.needs_intervention,
            }
        }
        ProbeOutcome::Degraded => Transition::to(Degraded),
        ProbeOutcome::Ok => Transition::to(healthy(input.kind, input.reserved)),
    }
}

fn healthy(kind: ResourceKind, reserved: bool) -> ResourceStatus {
    if kind == ResourceKind::Board && reserved {
        ResourceStatus::InUse
    } else {
        kind.idle_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Diagnostics;
    use crate::model::Utilization;
    use rstest::rstest;
    use ProbeOutcome::{Degraded as PD, Ok as POk, Unreachable as PU};
    use ResourceKind::{Board, BuildServer, Host};
    use ResourceStatus::*;

    fn input(kind: ResourceKind, status: ResourceStatus, outcome: ProbeOutcome) -> TransitionInput {
        TransitionInput {
            kind,
            status,
            outcome,
            consecutive_misses: if outcome == PU { 1 } else { 0 },
            miss_threshold: 0,
            needs_intervention: false,
            recovery_allowed: true,
            reserved: false,
        }
    }

    #[rstest]
    #[case(Host, Unknown, POk, Online)]
    #[case(BuildServer, Unknown, POk, Online)]
    #[case(Board, Unknown, POk, Available)]
    #[case(Host, Online, PD, Degraded)]
    #[case(Host, Degraded, POk, Online)]
    #[case(Host, Online, PU, Offline)]
    #[case(Host, Degraded, PU, Offline)]
    #[case(Host, Offline, POk, Online)]
    #[case(Board, Offline, POk, Available)]
    #[case(Host, Maintenance, POk, Maintenance)]
    #[case(Host, Maintenance, PU, Maintenance)]
    #[case(Board, Flashing, PU, Flashing)]
    #[case(Board, Recovery, POk, Recovery)]
    #[case(Board, Available, PD, Degraded)]
    fn test_transition_table(
        #[case] kind: ResourceKind,
        #[case] from: ResourceStatus,
        #[case] outcome: ProbeOutcome,
        #[case] to: ResourceStatus,
    ) {
        assert_eq!(next_status(input(kind, from, outcome)).status, to);
    }

    #[rstest]
    #[case(Board, true, false, true)]
    #[case(Board, false, false, false)]
    #[case(Board, true, true, false)]
    #[case(Host, true, false, false)]
    fn test_recovery_only_for_armed_boards(
        #[case] kind: ResourceKind,
        #[case] recovery_allowed: bool,
        #[case] needs_intervention: bool,
        #[case] expected: bool,
    ) {
        let t = next_status(TransitionInput {
            recovery_allowed,
            needs_intervention,
            ..input(kind, Available, PU)
        });
        assert_eq!(t.status, Offline);
        assert_eq!(t.attempt_recovery, expected);
    }

    #[test]
    fn test_offline_again_does_not_retry_recovery() {
        let t = next_status(TransitionInput {
            recovery_allowed: false,
            ..input(Board, Offline, PU)
        });
        assert_eq!(t, Transition::stay(Offline));
    }

    #[test]
    fn test_offline_board_without_attempt_is_recovered() {
        let t = next_status(input(Board, Offline, PU));
        assert_eq!(
            t,
            Transition {
                status: Offline,
                attempt_recovery: true,
            }
        );
    }

    #[test]
    fn test_needs_intervention_holds_offline() {
        let t = next_status(TransitionInput {
            needs_intervention: true,
            ..input(Board, Offline, POk)
        });
        assert_eq!(t.status, Offline);
    }

    #[test]
    fn test_miss_threshold_tolerates_misses() {
        let base = TransitionInput {
            miss_threshold: 2,
            ..input(Host, Online, PU)
        };
        for misses in 1..=2 {
            let t = next_status(TransitionInput {
                consecutive_misses: misses,
                ..base
            });
            assert_eq!(t.status, Online);
        }
        let t = next_status(TransitionInput {
            consecutive_misses: 3,
            ..base
        });
        assert_eq!(t.status, Offline);
    }

    #[test]
    fn test_reserved_board_goes_in_use() {
        let t = next_status(TransitionInput {
            reserved: true,
            ..input(Board, Degraded, POk)
        });
        assert_eq!(t.status, InUse);
    }

    fn reachable(metrics: Utilization, warnings: Vec<String>) -> Result<ProbeResult, ConnectorError> {
        Ok(ProbeResult {
            reachable: true,
            metrics,
            diagnostics: Diagnostics {
                warnings,
                detail: String::new(),
            },
        })
    }

    #[test]
    fn test_classify_thresholds_per_kind() {
        let t = HealthThresholds::default();

        let low_disk = Utilization {
            disk_free_gb: Some(9),
            ..Utilization::default()
        };
        assert_eq!(classify(BuildServer, &reachable(low_disk.clone(), vec![]), &t).outcome, PD);
        // Disk is only a build server threshold.
        assert_eq!(classify(Host, &reachable(low_disk, vec![]), &t).outcome, POk);

        let busy = Utilization {
            memory_percent: 86.0,
            ..Utilization::default()
        };
        let c = classify(Host, &reachable(busy, vec![]), &t);
        assert_eq!(c.outcome, PD);
        assert!(c.reasons[0].contains("86%"));

        let hot = Utilization {
            temperature_c: Some(91.0),
            ..Utilization::default()
        };
        assert_eq!(classify(Board, &reachable(hot, vec![]), &t).outcome, PD);
        assert_eq!(
            classify(
                Board,
                &reachable(Utilization::default(), vec!["serial console flapping".into()]),
                &t
            )
            .outcome,
            PD
        );
    }

    #[test]
    fn test_classify_unreachable() {
        let t = HealthThresholds::default();
        assert_eq!(classify(Host, &Err(ConnectorError::Refused), &t).outcome, PU);
        assert_eq!(
            classify(Host, &Ok(ProbeResult::unreachable("no route")), &t).reasons,
            vec!["no route".to_string()]
        );
    }
}
