//! VPN proxy pool manager
//!
//! Keeps a fixed-size pool of VPN egress proxy containers running on the
//! local Docker engine, rotates their endpoints on a timer, repairs drift
//! between rotations, and serves a small read-only status API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vpnpool_manager::{
    api,
    config::Config,
    directory::{Directory, DirectoryClient},
    orchestrator::{OrchestratorConfig, PoolOrchestrator},
    runtime::{ContainerRuntime, DockerRuntime},
    scheduler::PoolScheduler,
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Missing credentials are fatal before anything touches the engine
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to VPNPOOL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting VPN pool manager");
    info!(
        listen_addr = %config.listen_addr,
        capacity = config.layout.capacity(),
        base_port = config.layout.base_port(),
        rotation_order = ?config.rotation_order,
        "Configuration loaded"
    );

    let docker = DockerRuntime::new(
        &config.docker_socket,
        config.layout.clone(),
        config.container.clone(),
        config.credentials.clone(),
    );
    if !docker.socket_exists() {
        warn!(
            socket = %config.docker_socket.display(),
            "Docker socket not found, runtime commands will fail"
        );
    }
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let client = DirectoryClient::new(&config.directory)?;
    info!(url = %client.url(), "Directory client ready");
    let directory: Arc<dyn Directory> = Arc::new(client);

    let orchestrator = Arc::new(PoolOrchestrator::new(
        runtime,
        Arc::clone(&directory),
        OrchestratorConfig {
            layout: config.layout.clone(),
            rotation_order: config.rotation_order,
            runtime_timeout: config.runtime_timeout,
        },
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Rotation fires immediately, so the pool comes up without waiting
    let scheduler = PoolScheduler::new(Arc::clone(&orchestrator), config.schedule.clone());
    let handles = scheduler.spawn(shutdown_rx.clone());

    let state = AppState::new(Arc::clone(&orchestrator), directory);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
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
        signal = shutdown_signal() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signals");
            }
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

    // Signal shutdown to the scheduler loops and the server
    let _ = shutdown_tx.send(true);

    // Loops must be gone before the final cleanup lists containers, or an
    // in-flight cycle could create containers behind it.
    info!("Waiting for scheduler loops to shut down...");
    handles.join(Duration::from_secs(10)).await;

    let report = orchestrator.shutdown().await;
    info!(
        stopped = report.stopped,
        removed = report.removed,
        failed = report.failed,
        "Pool manager shutdown complete"
    );
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
