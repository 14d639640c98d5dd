#![forbid(unsafe_code)]

mod ice;
mod metrics;
mod room;
mod signaling;
mod upload;

use anyhow::Result;
use ice::StunConfig;
use metrics::ServerMetrics;
use room::RoomRegistry;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upload::UploadConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerchat=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("peerchat - Starting server");

    let metrics = ServerMetrics::new();
    let registry = Arc::new(RoomRegistry::new(metrics.clone()));

    let stun = StunConfig::from_env();
    info!("STUN servers: {}", stun.urls.join(", "));

    let upload_config = UploadConfig::from_env();
    info!(
        "Uploads stored in {} (limit {} bytes)",
        upload_config.dir.display(),
        upload_config.max_bytes
    );

    let server = SignalingServer::new(registry.clone(), stun, upload_config, metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            registry.shutdown();
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
