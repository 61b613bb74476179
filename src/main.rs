//! fedibridge binary entry point

use std::sync::Arc;

use fedibridge::host::{HandlerRegistry, LoggingHandler, MemoryDirectory};
use fedibridge::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Start delivery workers
/// 5. Start HTTP server, stopping everything on Ctrl-C
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEDIBRIDGE__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedibridge=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedibridge=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting fedibridge...");

    // 2. Initialize metrics
    if let Err(e) = fedibridge::metrics::init_metrics() {
        tracing::warn!(error = %e, "Failed to register metrics");
    }

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state with the in-process host
    let directory = Arc::new(MemoryDirectory::new());
    let handlers = HandlerRegistry::new().with_fallback(Arc::new(LoggingHandler::new()));
    let state = AppState::new(config.clone(), directory, handlers).await?;

    let recovered = state.pipeline.store().recover_in_flight().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "Requeued deliveries left in flight");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = state.pipeline.spawn_workers(shutdown_rx);

    // 5. Start HTTP server
    let app = fedibridge::build_router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Delivery worker panicked");
        }
    }

    tracing::info!("Stopped");
    Ok(())
}
