//! `ZVault` server entry point.
//!
//! Bootstraps storage and the vault core, then starts the Axum HTTP server
//! with graceful shutdown. On SIGINT/SIGTERM the HTTP server drains and the
//! core seals itself, releasing leadership and closing cluster listeners.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use zvault_core::{Core, CoreConfig, ListenerProvider, PortOffsetListenerProvider};
use zvault_storage::{HaBackend, MemoryBackend, MemoryHaBackend, StorageBackend};

use zvault_server::config::ServerConfig;
use zvault_server::routes;
use zvault_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid configuration")?;

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(
        bind_addr = %config.bind_addr,
        ha_enabled = config.ha_enabled,
        "ZVault starting"
    );

    let core = build_core(&config)?;
    let app = routes::router(Arc::new(AppState::new(core.clone())));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "ZVault server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    core.shutdown().await;
    info!("ZVault server stopped");
    Ok(())
}

/// Build the vault core over in-memory storage.
fn build_core(config: &ServerConfig) -> anyhow::Result<Core> {
    info!("using in-memory storage (data will not persist)");
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let listeners: Arc<dyn ListenerProvider> =
        Arc::new(PortOffsetListenerProvider::new(vec![config.bind_addr]));

    let mut core_config = CoreConfig::new(storage, config.advertise_addr.clone())
        .with_listener_provider(listeners)
        .with_timing(config.ha_timing());
    if config.ha_enabled {
        let ha: Arc<dyn HaBackend> = Arc::new(MemoryHaBackend::new());
        core_config = core_config.with_ha(ha);
    }
    if let Some(addr) = &config.cluster_addr {
        core_config = core_config.with_cluster_addr(addr.clone());
    }
    if let Some(name) = &config.cluster_name {
        core_config = core_config.with_cluster_name(name.clone());
    }

    Core::new(core_config).context("failed to build vault core")
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}
