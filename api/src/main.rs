use std::path::PathBuf;
use std::sync::Arc;

use coersion_api::{router, AppState};
use coersion_common::config::Config;
use coersion_core::task::check_producer_available;
use coersion_core::FramePipeline;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit.clone().unwrap_or_else(|| PathBuf::from("config.toml"));

    // Without an explicit path a missing config.toml just means defaults.
    let config = if explicit.is_none() && !config_path.exists() {
        Config::default()
    } else {
        match Config::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config from {}: {e}", config_path.display());
                std::process::exit(1);
            }
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    check_producer_available(&config.ffmpeg).await;

    let state = Arc::new(AppState::new(
        FramePipeline::new(config.ffmpeg.clone()),
        config.server.request_timeout(),
    ));
    let app = router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    info!(
        addr,
        producer = config.ffmpeg.binary,
        timeout_secs = config.server.request_timeout_secs,
        "coersion API server starting"
    );

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
