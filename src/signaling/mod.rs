#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;
pub mod service;

use crate::config::Config;
use crate::room::peer::Role;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use connection::ConnectionLimits;
use protocol::Identity;
use serde::Deserialize;
use service::SignalingService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    service: Arc<SignalingService>,
    connection_semaphore: Arc<Semaphore>,
    limits: ConnectionLimits,
    max_message_size: usize,
    metrics_token: Option<Arc<str>>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(service: Arc<SignalingService>, config: &Config) -> Self {
        info!("Max connections: {}", config.max_connections);
        Self {
            service,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            limits: ConnectionLimits {
                idle_timeout: config.idle_timeout,
                rate_limit_per_sec: config.rate_limit_per_sec,
            },
            max_message_size: config.max_message_size,
            metrics_token: config.metrics_token.as_deref().map(Arc::from),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = TcpListener::bind(&addr).await?;
        self.serve_listener(listener).await
    }

    /// Serves on an already bound listener
    pub async fn serve_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Identity query parameters set by the authenticating gateway
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityQuery {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub display_name: Option<String>,
}

impl IdentityQuery {
    /// Validates the parameters into an [`Identity`]
    pub fn into_identity(self) -> Result<Identity, String> {
        fn required(value: Option<String>, name: &str) -> Result<String, String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("missing {name}"))
        }

        let user_id = required(self.user_id, "userId")?;
        let role: Role = required(self.role, "role")?.parse()?;
        let display_name = required(self.display_name, "displayName")?;
        Ok(Identity {
            user_id: user_id.into(),
            role,
            display_name,
        })
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let registry = server.service.registry();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": registry.room_count(),
        "peers": registry.peer_count(),
    }))
}

/// Metrics handler, Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let registry = server.service.registry();
    let body = server
        .service
        .metrics()
        .render_prometheus(registry.room_count(), registry.peer_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<IdentityQuery>,
    State(server): State<SignalingServer>,
) -> Response {
    let identity = match query.into_identity() {
        Ok(identity) => identity,
        Err(reason) => {
            warn!("Rejecting WebSocket upgrade: {}", reason);
            return (StatusCode::BAD_REQUEST, reason).into_response();
        }
    };

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(server.max_message_size)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, identity, server.service, server.limits, permit)
        })
}
