use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tally_store::ConnectorState;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::client;
use crate::hub::BroadcastHub;
use crate::poller::PollStats;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub welcome_text: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            max_send_queue: 256,
            welcome_text: "Welcome!".into(),
        }
    }
}

impl ServerConfig {
    /// A hub sized and greeted according to this config.
    pub fn build_hub(&self) -> Arc<BroadcastHub> {
        Arc::new(BroadcastHub::new(self.max_send_queue, self.welcome_text.clone()))
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub store_state: watch::Receiver<ConnectorState>,
    pub poll_stats: Arc<PollStats>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. The server shuts down gracefully when `cancel` fires.
pub async fn start(
    config: &ServerConfig,
    state: AppState,
    cancel: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Tally server started");

    let server = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the server task to finish (after cancellation).
    pub async fn wait(self) {
        if let Err(e) = self.server.await {
            tracing::error!(error = %e, "server task failed");
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.hub.register();
    tracing::info!(connection_id = %connection_id, "WebSocket client connected");
    let _ = state.hub.on_connect(&connection_id);

    client::handle_ws_connection(socket, connection_id, rx, state.hub).await;
}

/// Health check HTTP endpoint. 200 only while the store is connected.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store_state.borrow().clone();
    let body = serde_json::json!({
        "status": if store == ConnectorState::Connected { "healthy" } else { "degraded" },
        "store": store.as_str(),
        "hub": state.hub.stats(),
        "poller": state.poll_stats.snapshot(),
    });

    let http_status = if store == ConnectorState::Connected {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, axum::Json(body))
}
