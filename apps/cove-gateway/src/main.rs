use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cove_gateway::config::{Cli, ServerConfig};
use cove_gateway::manager::{ManagerOptions, SessionManager};
use cove_gateway::pipeline::EchoPipeline;
use cove_gateway::{router, AppState};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    // task panics are logged, never fatal
    std::panic::set_hook(Box::new(|info| {
        error!("panic in handler: {info}");
    }));

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        product_id = %config.product_id,
        compression = config.enable_compression,
        "starting cove gateway"
    );

    let manager = SessionManager::new(
        EchoPipeline::factory(),
        ManagerOptions {
            accounts_url: config.accounts_url.clone(),
            soft_shutdown_ticks: config.soft_shutdown_ticks,
            tick_interval: Duration::from_secs(60),
        },
    );
    let pump = manager.spawn_broadcast_pump();
    let ticker = manager.spawn_ticker();

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let state = Arc::new(AppState {
        manager: manager.clone(),
        config: config.clone(),
        metrics,
        shutdown: shutdown_tx,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("cove gateway listening on {}", config.listen_addr);

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = signal::ctrl_c() => info!("interrupt received"),
                _ = shutdown_rx.recv() => info!("reboot requested, shutting down"),
            }
        })
        .await
        .context("server shutdown with error")?;

    manager
        .close_everything(cove_gateway::manager::CloseCause::Shutdown)
        .await;
    ticker.abort();
    pump.abort();
    info!("shutdown complete");

    Ok(())
}
