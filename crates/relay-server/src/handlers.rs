//! HTTP and WebSocket handlers for the Relay server.
//!
//! This module wires the relay into axum: the upgrade endpoint, the roster
//! query, health, and the optional static file fallback.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, DeliveryMetrics, MeteredStream};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use relay_core::Relay;
use relay_transport::{axum_ws, Connection};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The chat relay.
    pub relay: Relay,
    /// Server configuration.
    pub config: Config,
    /// WebSocket connections holding a slot, upgrades in flight included.
    connections: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(relay: Relay, config: Config) -> Self {
        Self {
            relay,
            config,
            connections: AtomicUsize::new(0),
        }
    }

    /// Reserve one of the `limits.max_connections` slots.
    ///
    /// Returns `None` when every slot is taken.
    fn try_reserve(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(ConnectionSlot {
            state: Arc::clone(self),
        })
    }
}

/// A reserved connection slot, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let (relay, worker) = Relay::new(config.relay_config());
    let observer = Arc::new(DeliveryMetrics::new(Arc::clone(relay.registry())));
    let worker = tokio::spawn(worker.with_observer(observer).run());

    let state = Arc::new(AppState::new(relay.clone(), config.clone()));
    let app = build_router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay.shutdown();
    let delivered = worker.await.context("Hub worker panicked")?;
    info!(messages = delivered, "Relay server stopped");

    Ok(())
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let config = &state.config;

    let mut app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route(&config.transport.roster_path, get(roster_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state));

    if let Some(dir) = &config.http.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    if config.http.cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }

    app.layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.relay.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "users": stats.identified_count,
    }))
}

/// Roster query handler.
async fn roster_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.relay.roster())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    // Reserved before the upgrade, released when the session ends
    let Some(slot) = state.try_reserve() else {
        warn!(
            max = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_error("capacity");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

/// Hand an upgraded WebSocket to the relay and wait for its session to end.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (_, sink, stream) =
        axum_ws::into_connection(socket, state.config.limits.max_message_size).into_parts();
    let connection = Connection::new(sink, Box::new(MeteredStream::new(stream)));
    let connection_id = connection.id().clone();

    debug!(connection = %connection_id, "WebSocket connected");

    match state.relay.accept(connection) {
        Ok(session) => match session.await {
            Ok(reason) => {
                debug!(connection = %connection_id, reason = ?reason, "WebSocket disconnected");
            }
            Err(e) => {
                error!(connection = %connection_id, error = %e, "Session task failed");
                metrics::record_error("session");
            }
        },
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Rejected connection");
            metrics::record_error("registry");
        }
    }
}
