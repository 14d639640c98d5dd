#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::ice::{IceServer, StunConfig};
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use crate::upload::{self, UploadConfig};
use axum::{
    extract::{ws::WebSocketUpgrade, DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    registry: Arc<RoomRegistry>,
    stun: Arc<StunConfig>,
    upload: Arc<UploadConfig>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(
        registry: Arc<RoomRegistry>,
        stun: StunConfig,
        upload: UploadConfig,
        metrics: ServerMetrics,
    ) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        Self {
            registry,
            stun: Arc::new(stun),
            upload: Arc::new(upload),
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn upload_config(&self) -> &UploadConfig {
        &self.upload
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        // Body limit leaves headroom for multipart framing around the image itself
        let upload_body_limit = self.upload.max_bytes + 16 * 1024;
        let uploads_dir = self.upload.dir.clone();

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/ice-servers", get(ice_servers_handler))
            .route(
                "/upload",
                post(upload::upload_handler).layer(DefaultBodyLimit::max(upload_body_limit)),
            )
            .route_service("/room/{room}", ServeFile::new("public/index.html"))
            .nest_service("/uploads", ServeDir::new(uploads_dir))
            .with_state(self)
            .layer(CorsLayer::permissive())
            .fallback_service(ServeDir::new("public"))
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(
    State(server): State<SignalingServer>,
) -> Json<serde_json::Value> {
    let rooms = server.registry.room_count();
    let members = server.registry.total_member_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "members": members,
    }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Response {
    // Check bearer token if METRICS_TOKEN is configured
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers.get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {}", expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.registry.room_count();
    let members = server.registry.total_member_count().await;
    let body = server.metrics.render_prometheus(rooms, members);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ).into_response()
}

/// STUN server list for clients' peer-connection setup
async fn ice_servers_handler(
    State(server): State<SignalingServer>,
) -> Json<Vec<IceServer>> {
    Json(server.stun.ice_servers())
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SignalingServer>,
) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.registry,
                server.metrics,
                permit,
            )
        })
}
