//! testfarm Engine
//!
//! Runs the resource engine for a test farm: loads the inventory, probes
//! every resource on its interval, recovers unreachable boards and reaps
//! expired reservations.
//!
//! ## Background Workers
//!
//! - **Health workers**: one per resource kind, each on its own interval
//! - **Reservation reaper**: expires abandoned reservations, serves the queue
//!   and audits capacity bookkeeping
//!
//! Connectors are the in-memory mock fleet until real SSH/libvirt/PDU
//! connectors are wired in.

use std::sync::Arc;

use anyhow::{Context, Result};
use testfarm_engine::connector::MockFleet;
use testfarm_engine::pipeline::CommandStageExecutor;
use testfarm_engine::{Connectors, Engine, EngineConfig, Inventory, SystemClock};
use testfarm_events::ResourceKind;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting testfarm engine");
    info!(
        probe_timeout_ms = config.probe_timeout.as_millis() as u64,
        reservation_ttl_secs = config.default_reservation_ttl.as_secs(),
        inventory = ?config.inventory_path,
        stage_commands = config.stage_commands.len(),
        "Configuration loaded"
    );

    // Connectors (mock for now)
    let fleet = Arc::new(MockFleet::new());
    let executor = config
        .stage_commands
        .iter()
        .fold(CommandStageExecutor::new(fleet.clone()), |executor, (stage, command)| {
            executor.with_command(*stage, command.clone())
        });

    let engine = Arc::new(Engine::new(
        config.clone(),
        Connectors::uniform(fleet),
        Arc::new(executor),
        Arc::new(SystemClock),
    ));

    // Seed the inventory
    match &config.inventory_path {
        Some(path) => {
            let inventory = Inventory::load(path).with_context(|| format!("loading {}", path.display()))?;
            let registered = engine.seed(inventory).await?;
            info!(registered, groups = engine.groups().await.len(), "Inventory seeded");
        }
        None => warn!("No inventory configured (TESTFARM_INVENTORY); starting with an empty registry"),
    }

    // First health round before anything can be allocated
    let checks = engine.check_all().await;
    info!(probed = checks.len(), "Initial health round complete");
    for kind in ResourceKind::ALL {
        let resources = engine.resources_of(kind).await;
        let healthy = resources.iter().filter(|r| r.status.is_healthy()).count();
        info!(kind = %kind, total = resources.len(), healthy, "Fleet status");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = engine.spawn_workers(shutdown_rx);

    // Wait for shutdown signal
    let mut exit = Ok(());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = workers.reaper => {
            match result {
                Ok(Ok(())) => info!("Reservation reaper exited"),
                Ok(Err(e)) => {
                    error!(error = %e, "Reservation reaper stopped on a fatal error");
                    exit = Err(e.into());
                }
                Err(e) => error!(error = %e, "Reservation reaper panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    for handle in workers.health {
        if let Err(e) = handle.await {
            error!(error = %e, "Health worker panicked");
        }
    }

    info!(
        active_reservations = engine.active_reservations().await.len(),
        queued = engine.queued().await.len(),
        "Engine shutdown complete"
    );
    exit
}
