//! Daemon assembly: state store, registry, ledger, orchestrator, background
//! loops and the REST API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{error, info, warn};

use provisor_ledger::InstanceLedger;
use provisor_orchestrator::{MemoryChannel, NodeChannel, Orchestrator};
use provisor_registry::NodeRegistry;
use provisor_state::StateStore;

use crate::node_channel::HttpNodeChannel;
use crate::settings::Settings;

pub async fn run(settings: Settings, simulate_nodes: bool) -> anyhow::Result<()> {
    info!("provisor daemon starting");

    std::fs::create_dir_all(&settings.data_dir)?;
    let db_path = settings.data_dir.join("provisor.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let registry = Arc::new(NodeRegistry::load(state.clone(), settings.registry.clone())?);
    let health_events = registry.subscribe();
    info!(nodes = registry.snapshot().len(), "node registry loaded");

    let ledger = InstanceLedger::new(state, Arc::clone(&registry));

    let channel: Arc<dyn NodeChannel> = if simulate_nodes {
        warn!("node commands are simulated in memory; no node will be contacted");
        Arc::new(MemoryChannel::new())
    } else {
        Arc::new(HttpNodeChannel::new())
    };

    let orchestrator = Arc::new(Orchestrator::new(ledger, channel, settings.orchestrator.clone()));
    orchestrator.recover().await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let sweep_handle = tokio::spawn(run_sweeper(
        Arc::clone(&registry),
        settings.sweep_interval,
        shutdown_rx.clone(),
    ));

    let events_handle = tokio::spawn(
        Arc::clone(&orchestrator).run_health_events(health_events, shutdown_rx.clone()),
    );

    info!(interval = ?settings.reconcile_interval, "reconciler starting");
    let reconcile_handle = tokio::spawn(
        Arc::clone(&orchestrator).run_reconciler(settings.reconcile_interval, shutdown_rx),
    );

    // ── Start API server ───────────────────────────────────────

    let router = provisor_api::build_router(orchestrator);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = sweep_handle.await;
    let _ = events_handle.await;
    let _ = reconcile_handle.await;

    info!("provisor daemon stopped");
    Ok(())
}

/// Demote silent nodes every `interval`. Health events reach the
/// orchestrator through the registry's subscription.
async fn run_sweeper(registry: Arc<NodeRegistry>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match registry.sweep(epoch_secs()) {
                    Ok(events) if !events.is_empty() => {
                        info!(count = events.len(), "node health changed");
                    }
                    Err(e) => {
                        warn!(error = %e, "node sweep failed");
                    }
                    _ => {}
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
