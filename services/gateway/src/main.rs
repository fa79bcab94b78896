mod auth;
mod error;
mod handlers;
mod models;
mod rate_limit;
mod router;
mod state;

use execution_engine::config::EngineConfig;
use execution_engine::engine::EngineBuilder;
use router::create_router;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting execution engine gateway");

    let config = EngineConfig::from_env()?;
    let engine = Arc::new(EngineBuilder::new(config.clone()).build()?);
    let recovered = engine.start().await?;
    tracing::info!(recovered, "Engine ready");

    let state = AppState::new(engine.clone(), &config.gateway);
    let app = create_router(state);

    // Bind and serve
    let addr: SocketAddr = config.gateway.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Ctrl-C received, shutting down");
}
