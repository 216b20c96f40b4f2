#![forbid(unsafe_code)]

// Signaling module - HTTP routes and WebSocket admission

pub mod connection;
pub mod handler;
pub mod protocol;

use crate::auth::{self, google::CredentialVerifier};
use crate::config::Config;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use connection::Admission;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Largest accepted signaling frame.
const MAX_FRAME_BYTES: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    config: Arc<Config>,
    verifier: Option<Arc<dyn CredentialVerifier>>,
}

/// Query string of the WebSocket upgrade request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub room_id: Option<String>,
    pub token: Option<String>,
}

impl SignalingServer {
    pub fn new(
        config: Config,
        registry: Arc<RoomRegistry>,
        metrics: ServerMetrics,
        verifier: Option<Arc<dyn CredentialVerifier>>,
    ) -> Self {
        info!("Max connections: {}", config.max_connections);
        if verifier.is_none() {
            info!("GOOGLE_CLIENT_ID not set, external sign-in disabled");
        }
        Self {
            registry,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            verifier,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn jwt_secret(&self) -> &str {
        &self.config.jwt_secret
    }

    pub fn session_token_ttl(&self) -> Duration {
        self.config.session_token_ttl
    }

    pub fn credential_verifier(&self) -> Option<Arc<dyn CredentialVerifier>> {
        self.verifier.clone()
    }

    fn cors_layer(&self) -> CorsLayer {
        let Some(origin) = self.config.client_origin.as_deref() else {
            return CorsLayer::permissive();
        };
        match origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
            Err(_) => {
                warn!("CLIENT_ORIGIN {:?} is not a valid header value, allowing any origin", origin);
                CorsLayer::permissive()
            }
        }
    }

    /// Checks the upgrade request's token and room id. Nothing in the room
    /// layer is touched until this succeeds.
    fn admission(&self, params: WsParams, headers: &HeaderMap) -> Result<Admission, (StatusCode, &'static str)> {
        let token = params
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or_else(|| auth::bearer_token(headers))
            .ok_or((StatusCode::UNAUTHORIZED, "Missing token"))?;
        let claims = auth::jwt::verify_session_token(token, self.jwt_secret())
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token"))?;

        let room_id = params
            .room_id
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .ok_or((StatusCode::BAD_REQUEST, "Missing roomId"))?;

        Ok(Admission {
            room_id,
            user: claims.profile(),
        })
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        let cors = self.cors_layer();
        let static_dir = self.config.static_dir.clone();

        let api_routes = Router::new()
            .route("/auth/google", post(crate::auth::routes::google_login))
            .route("/rooms", post(crate::room::api::create_room))
            .route("/rooms/:room_id", get(crate::room::api::get_room));

        let router = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .nest("/api", api_routes)
            .with_state(self)
            .layer(cors);

        match static_dir {
            Some(dir) => router.fallback_service(ServeDir::new(dir)),
            None => router,
        }
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
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.registry.room_count(),
        "participants": server.registry.total_participant_count(),
    }))
}

/// Metrics handler - Prometheus text exposition format.
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let body = server
        .metrics
        .render_prometheus(server.registry.room_count(), server.registry.total_participant_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(
    State(server): State<SignalingServer>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let admission = match server.admission(params, &headers) {
        Ok(admission) => admission,
        Err((status, reason)) => {
            debug!("Rejected WebSocket upgrade: {}", reason);
            return (status, reason).into_response();
        }
    };
    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "Expected WebSocket upgrade").into_response();
    };

    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_FRAME_BYTES)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, admission, server.registry, server.metrics, permit)
        })
}
