//! Presence engine binary: wires the configured storage backend, starts
//! the service and watchdog, and serves the peripheral HTTP/WebSocket
//! gateway.

use anyhow::Result;
use presence_engine::config::EngineConfig;
use presence_engine::service::PresenceService;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::from_env();
    let port = config.server_port;

    let service = Arc::new(PresenceService::new(config));
    service.initialize().await?;
    tracing::info!("presence service initialized");

    let app = presence_engine::api::routes(service.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_service = service.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_service.shutdown().await;
        })
        .await?;

    Ok(())
}
