//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use testfarm_engine::clock::ManualClock;
use testfarm_engine::config::EngineConfig;
use testfarm_engine::connector::MockFleet;
use testfarm_engine::model::{
    BoardSpec, BuildServerSpec, Capacity, ConnectionInfo, HostSpec, PowerControl, Resource, ResourceSpec,
};
use testfarm_engine::pipeline::ScriptedExecutor;
use testfarm_engine::{Connectors, Engine};
use testfarm_id::ResourceId;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// An engine over a mock fleet with a manual clock.
pub struct Farm {
    pub engine: Arc<Engine>,
    pub fleet: Arc<MockFleet>,
    pub executor: Arc<ScriptedExecutor>,
    pub clock: Arc<ManualClock>,
}

/// Default configuration with power-cycle timings short enough for tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        power_cycle_delay: Duration::from_millis(10),
        power_poll_interval: Duration::from_millis(5),
        power_responsive_timeout: Duration::from_millis(100),
        ..EngineConfig::default()
    }
}

pub fn farm() -> Farm {
    farm_with(fast_config())
}

pub fn farm_with(config: EngineConfig) -> Farm {
    let fleet = Arc::new(MockFleet::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::fixed());
    let engine = Arc::new(Engine::new(
        config,
        Connectors::uniform(fleet.clone()),
        executor.clone(),
        clock.clone(),
    ));
    Farm {
        engine,
        fleet,
        executor,
        clock,
    }
}

impl Farm {
    /// Register a resource and bring it up with one successful probe.
    pub async fn add(&self, resource: Resource) -> ResourceId {
        let id = self.engine.register(resource).await.unwrap().id;
        self.engine.check_health(&id).await.unwrap();
        id
    }
}

pub fn id(s: &str) -> ResourceId {
    ResourceId::parse(s).unwrap()
}

pub fn capacity(cores: u32, architecture: &str) -> Capacity {
    Capacity {
        cpu_cores: cores,
        memory_mb: 1024 * u64::from(cores),
        storage_gb: 500,
        architectures: [architecture.to_string()].into(),
    }
}

pub fn build_server(name: &str, toolchain: &str) -> Resource {
    Resource::new(
        id(name),
        ResourceSpec::BuildServer(BuildServerSpec {
            toolchains: [toolchain.to_string()].into(),
            max_concurrent_jobs: 2,
        }),
        capacity(32, "x86_64"),
        ConnectionInfo::new(format!("{}.lab", name.to_lowercase())),
    )
}

pub fn host(name: &str, cores: u32, kvm: bool) -> Resource {
    Resource::new(
        id(name),
        ResourceSpec::Host(HostSpec {
            kvm,
            nested_virt: false,
            max_vms: 4,
        }),
        capacity(cores, "x86_64"),
        ConnectionInfo::new(format!("{}.lab", name.to_lowercase())),
    )
}

pub fn board(name: &str, with_pdu: bool) -> Resource {
    Resource::new(
        id(name),
        ResourceSpec::Board(BoardSpec {
            board_type: "rpi4".to_string(),
            power_control: with_pdu.then(|| PowerControl::Pdu {
                endpoint: "pdu-1.lab".to_string(),
                outlet: 3,
            }),
            ..BoardSpec::default()
        }),
        capacity(4, "arm64"),
        ConnectionInfo::new(format!("{}.lab", name.to_lowercase())),
    )
}
