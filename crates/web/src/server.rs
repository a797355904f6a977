//! Web server implementation

use crate::auth::TokenIssuer;
use crate::oauth::OAuthClient;
use crate::routes;
use axum::{
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use meshgate_common::relay::DuplexRelay;
use meshgate_common::{Broker, DeviceRegistry, TrustAuthority};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handler state
pub struct AppState {
    pub registry: Arc<dyn DeviceRegistry>,
    pub broker: Arc<dyn Broker>,
    pub authority: Arc<TrustAuthority>,
    pub tokens: TokenIssuer,
    pub oauth: Option<OAuthClient>,
    pub duplex: DuplexRelay,
    /// Keep-alive interval on long-lived event streams
    pub probe_interval: Duration,
}

impl AppState {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        broker: Arc<dyn Broker>,
        authority: Arc<TrustAuthority>,
        tokens: TokenIssuer,
        probe_interval: Duration,
    ) -> Self {
        let duplex = DuplexRelay::new(broker.clone(), registry.clone(), probe_interval);
        Self {
            registry,
            broker,
            authority,
            tokens,
            oauth: None,
            duplex,
            probe_interval,
        }
    }

    pub fn with_oauth(mut self, oauth: OAuthClient) -> Self {
        self.oauth = Some(oauth);
        self
    }
}

/// Web server
#[derive(Clone)]
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Create router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            // Login handoff
            .route("/sse/:token", get(routes::signaling::login_sse_handler))
            .route("/login/:token", get(routes::session::login_handler))
            .route("/auth/google/callback", get(routes::session::callback_handler))
            .route("/refresh", post(routes::session::refresh_handler))
            // Registry
            .route("/device", post(routes::devices::register_device_handler))
            .route("/devices", get(routes::devices::list_devices_handler))
            .route("/node", post(routes::devices::register_node_handler))
            .route("/peers", get(routes::devices::list_peers_handler))
            // Issuance
            .route("/nebula/sign-public-key", post(routes::devices::sign_public_key_handler))
            // Device signaling
            .route("/device/send/:id", post(routes::signaling::send_handler))
            .route("/device/receive/:id", get(routes::signaling::receive_handler))
            .route("/stream", get(routes::signaling::stream_handler))
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the web server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("HTTP gateway starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "meshgate"
    }))
}
