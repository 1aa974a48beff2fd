//! flotilla engine daemon.
//!
//! Runs one engine for the local machine against an in-process registry,
//! with the unit-state stream feeding the event bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flotilla_engine::config::Config;
use flotilla_engine::unit_stream::run_unit_state_stream;
use flotilla_engine::{Cluster, Engine, EngineWorker, MemoryRegistry};

/// How long to wait for tasks after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        machine_id = %config.machine_id,
        lock_ttl_secs = config.lock_ttl.as_secs(),
        capacity = %config.capacity,
        "Starting flotilla engine"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = MemoryRegistry::with_lock_ttl(config.lock_ttl);
    let machine = config.local_machine();
    registry.register_machine(machine.clone());

    let cluster = Cluster::new().with_max_candidates(config.max_offer_candidates);
    let engine = Arc::new(Engine::new(Arc::new(registry.clone()), machine, cluster));
    let worker = EngineWorker::new(engine, Arc::new(registry), config.event_buffer);

    // The service manager integration feeds this channel.
    let (_units_tx, units_rx) = mpsc::channel(16);
    let unit_handle = tokio::spawn(run_unit_state_stream(
        units_rx,
        worker.event_sender(),
        shutdown_rx.clone(),
    ));
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for tasks to shut down...");
    let join = async {
        let (unit, worker) = tokio::join!(unit_handle, worker_handle);
        for (task, result) in [("unit_stream", unit), ("worker", worker)] {
            if let Err(e) = result {
                error!(task, error = %e, "Task panicked");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, join).await.is_err() {
        warn!("Timed out waiting for tasks to shut down");
    }

    info!("flotilla engine shutdown complete");
    Ok(())
}
