//! docbroker server.
//!
//! - Receives repository push notifications and queues them
//! - Runs the New/Updated/Deleted change-feed passes on an interval
//! - Drains the publication queue once a day
//! - Keeps webhook subscriptions alive

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use docbroker_server::config::Config;
use docbroker_server::{router, scheduler, Services};
use docbroker_sync::BrokerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting docbroker-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Settings: {}", config.settings.display());

    let settings = BrokerSettings::from_file(&config.settings)?;
    info!(
        "  Monitoring {} container(s), object ids {}<year>-<n>",
        settings.containers.len(),
        settings.object_id_prefix
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let services = Services::from_config(&config, settings, shutdown_rx.clone())?;
    let tasks = scheduler::spawn_all(&services, &config, shutdown_rx);

    let app = router(services);

    // Bind and serve
    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task ended abnormally: {}", e);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
