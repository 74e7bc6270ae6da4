//! ipruler controller
//!
//! Merges the cluster baseline with each node-group overlay and pushes the
//! result to the ipruler agents on matching nodes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use ipruler_controller::{
    agent::HttpAgentClient,
    api, config,
    controllers::{self, Context},
    locator::ActiveBaselineLocator,
    manifest::Manifest,
    resources::{FullConfig, NodeConfig},
    state::AppState,
    store::{gc::GarbageCollector, Cluster},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const GC_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to IPRULER_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let settings = &config.controllers;
    info!("Starting ipruler controller");
    info!(
        listen_addr = %config.listen_addr,
        agent_namespace = %settings.agent.namespace,
        agent_label = %format!("{}={}", settings.agent.label_key, settings.agent.label_value),
        agent_port = settings.agent.api_port,
        cleanup_on_delete = settings.cleanup_on_delete,
        "Configuration loaded"
    );

    let cluster = Cluster::in_memory();
    if let Some(path) = &config.manifest {
        Manifest::load(path)?.apply(&cluster).await?;
    }

    let locator = ActiveBaselineLocator::new();
    let transport =
        Arc::new(HttpAgentClient::new(&settings.agent).context("failed to build agent client")?);
    let ctx = Arc::new(Context::new(
        cluster.clone(),
        locator.clone(),
        config.controllers.clone(),
        transport,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = controllers::spawn_all(ctx, shutdown_rx.clone());

    let collector = GarbageCollector::<NodeConfig, FullConfig>::new(
        cluster.node_configs.clone(),
        cluster.full_configs.clone(),
        GC_SWEEP_INTERVAL,
    );
    workers.push(tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { collector.run(shutdown_rx).await }
    }));

    let app = api::create_router(AppState::new(cluster, locator));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for worker in workers {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, worker).await {
            warn!(error = %e, "Worker did not shut down in time");
        }
    }

    info!("Controller shutdown complete");
    Ok(())
}
