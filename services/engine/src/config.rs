//! Configuration for the engine.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use testfarm_events::{ResourceKind, StageKind};
use testfarm_reconcile::{DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT};

/// Thresholds that turn a successful probe into a degraded one.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Build servers below this much free disk are degraded.
    pub min_disk_free_gb: u64,

    /// Hosts above this CPU or memory utilization (percent) are degraded.
    pub max_host_utilization_percent: f32,

    /// Boards hotter than this are degraded.
    pub max_board_temperature_c: f32,

    /// Consecutive missed probes tolerated before a resource goes offline.
    /// With 0, the first miss is enough.
    pub miss_threshold: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_disk_free_gb: 10,
            max_host_utilization_percent: 85.0,
            max_board_temperature_c: 85.0,
            miss_threshold: 0,
        }
    }
}

/// Relative weights of the utilization score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringWeights {
    pub cpu: u32,
    pub memory: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self { cpu: 50, memory: 50 }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Probe interval for build servers.
    pub build_probe_interval: Duration,

    /// Probe interval for QEMU hosts.
    pub host_probe_interval: Duration,

    /// Probe interval for boards.
    pub board_probe_interval: Duration,

    /// Upper bound on a single probe.
    pub probe_timeout: Duration,

    /// Degradation thresholds.
    pub thresholds: HealthThresholds,

    /// Health records kept per resource.
    pub health_history_limit: usize,

    /// Reservation lifetime when the caller does not pick one.
    pub default_reservation_ttl: Duration,

    /// How often expired reservations are reaped.
    pub reaper_interval: Duration,

    /// Off-to-on delay of an automatic power cycle.
    pub power_cycle_delay: Duration,

    /// How often a power-cycled board is polled for responsiveness.
    pub power_poll_interval: Duration,

    /// How long a power-cycled board gets to answer.
    pub power_responsive_timeout: Duration,

    /// Upper bound on a firmware flash.
    pub flash_timeout: Duration,

    /// Selection score weights.
    pub scoring: ScoringWeights,

    /// Events kept for dashboard queries.
    pub recent_events_limit: usize,

    /// Optional JSON inventory seeded at startup.
    pub inventory_path: Option<PathBuf>,

    /// Remote command run for each pipeline stage by the binary's stage
    /// executor. Stages without one succeed immediately.
    pub stage_commands: BTreeMap<StageKind, String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            build_probe_interval: DEFAULT_PROBE_INTERVAL,
            host_probe_interval: DEFAULT_PROBE_INTERVAL,
            board_probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            thresholds: HealthThresholds::default(),
            health_history_limit: 1000,
            default_reservation_ttl: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(15),
            power_cycle_delay: Duration::from_secs(5),
            power_poll_interval: Duration::from_millis(1000),
            power_responsive_timeout: Duration::from_secs(60),
            flash_timeout: Duration::from_secs(900),
            scoring: ScoringWeights::default(),
            recent_events_limit: 512,
            inventory_path: None,
            stage_commands: BTreeMap::new(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let probe_interval = env_secs("TESTFARM_PROBE_INTERVAL_SECS")
            .unwrap_or(defaults.build_probe_interval);
        let build_probe_interval =
            env_secs("TESTFARM_PROBE_INTERVAL_BUILD_SECS").unwrap_or(probe_interval);
        let host_probe_interval =
            env_secs("TESTFARM_PROBE_INTERVAL_HOST_SECS").unwrap_or(probe_interval);
        let board_probe_interval =
            env_secs("TESTFARM_PROBE_INTERVAL_BOARD_SECS").unwrap_or(probe_interval);

        let probe_timeout = env_secs("TESTFARM_PROBE_TIMEOUT_SECS").unwrap_or(defaults.probe_timeout);

        let thresholds = HealthThresholds {
            min_disk_free_gb: env_parse("TESTFARM_MIN_DISK_FREE_GB")
                .unwrap_or(defaults.thresholds.min_disk_free_gb),
            max_host_utilization_percent: env_parse("TESTFARM_MAX_HOST_UTILIZATION")
                .unwrap_or(defaults.thresholds.max_host_utilization_percent),
            max_board_temperature_c: env_parse("TESTFARM_MAX_BOARD_TEMP_C")
                .unwrap_or(defaults.thresholds.max_board_temperature_c),
            miss_threshold: env_parse("TESTFARM_MISS_THRESHOLD")
                .unwrap_or(defaults.thresholds.miss_threshold),
        };

        let scoring = ScoringWeights {
            cpu: env_parse("TESTFARM_SCORE_CPU_WEIGHT").unwrap_or(defaults.scoring.cpu),
            memory: env_parse("TESTFARM_SCORE_MEMORY_WEIGHT").unwrap_or(defaults.scoring.memory),
        };

        let config = Self {
            build_probe_interval,
            host_probe_interval,
            board_probe_interval,
            probe_timeout,
            thresholds,
            health_history_limit: env_parse("TESTFARM_HEALTH_HISTORY_LIMIT")
                .unwrap_or(defaults.health_history_limit),
            default_reservation_ttl: env_secs("TESTFARM_RESERVATION_TTL_SECS")
                .unwrap_or(defaults.default_reservation_ttl),
            reaper_interval: env_secs("TESTFARM_REAPER_INTERVAL_SECS")
                .unwrap_or(defaults.reaper_interval),
            power_cycle_delay: env_secs("TESTFARM_POWER_CYCLE_DELAY_SECS")
                .unwrap_or(defaults.power_cycle_delay),
            power_poll_interval: env_parse("TESTFARM_POWER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.power_poll_interval),
            power_responsive_timeout: env_secs("TESTFARM_POWER_RESPONSIVE_TIMEOUT_SECS")
                .unwrap_or(defaults.power_responsive_timeout),
            flash_timeout: env_secs("TESTFARM_FLASH_TIMEOUT_SECS").unwrap_or(defaults.flash_timeout),
            scoring,
            recent_events_limit: env_parse("TESTFARM_RECENT_EVENTS_LIMIT")
                .unwrap_or(defaults.recent_events_limit),
            inventory_path: std::env::var("TESTFARM_INVENTORY").ok().map(PathBuf::from),
            stage_commands: StageKind::ALL
                .into_iter()
                .filter_map(|stage| {
                    let var = format!("TESTFARM_{}_COMMAND", stage.as_str().to_uppercase());
                    std::env::var(var)
                        .ok()
                        .filter(|command| !command.trim().is_empty())
                        .map(|command| (stage, command))
                })
                .collect(),
            log_level: std::env::var("TESTFARM_LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        Ok(config.normalized())
    }

    /// Probe interval for one resource kind.
    pub fn probe_interval(&self, kind: ResourceKind) -> Duration {
        match kind {
            ResourceKind::BuildServer => self.build_probe_interval,
            ResourceKind::Host => self.host_probe_interval,
            ResourceKind::Board => self.board_probe_interval,
        }
    }

    /// Clamp values that would break detection latency or make loops spin.
    pub fn normalized(mut self) -> Self {
        for interval in [
            &mut self.build_probe_interval,
            &mut self.host_probe_interval,
            &mut self.board_probe_interval,
            &mut self.reaper_interval,
            &mut self.power_poll_interval,
        ] {
            if interval.is_zero() {
                *interval = Duration::from_millis(100);
            }
        }

        // A probe must finish inside the shortest interval, otherwise a
        // failure could take more than one interval to be noticed.
        let shortest = ResourceKind::ALL
            .iter()
            .map(|kind| self.probe_interval(*kind))
            .min()
            .unwrap_or(DEFAULT_PROBE_INTERVAL);
        if self.probe_timeout.is_zero() || self.probe_timeout >= shortest {
            self.probe_timeout = shortest / 2;
        }

        if self.scoring.cpu == 0 && self.scoring.memory == 0 {
            self.scoring = ScoringWeights::default();
        }

        self.health_history_limit = self.health_history_limit.max(1);
        self.recent_events_limit = self.recent_events_limit.max(1);
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout_below_interval() {
        let config = EngineConfig::default().normalized();
        assert!(config.probe_timeout < config.board_probe_interval);
        assert_eq!(config.thresholds.min_disk_free_gb, 10);
        assert_eq!(config.thresholds.miss_threshold, 0);
    }

    #[test]
    fn test_normalize_clamps_timeout() {
        let config = EngineConfig {
            board_probe_interval: Duration::from_secs(4),
            probe_timeout: Duration::from_secs(10),
            ..EngineConfig::default()
        }
        .normalized();

        assert_eq!(config.probe_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_normalize_restores_zero_weights() {
        let config = EngineConfig {
            scoring: ScoringWeights { cpu: 0, memory: 0 },
            ..EngineConfig::default()
        }
        .normalized();

        assert_eq!(config.scoring, ScoringWeights::default());
    }
}
