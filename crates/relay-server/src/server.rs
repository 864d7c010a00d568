//! `GatewayServer`: Axum HTTP + WebSocket server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_runtime::GatewayRuntime;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{Authenticator, SharedSecretAuth};
use crate::config::ServerConfig;
use crate::health::{GatewayCounts, HealthResponse};
use crate::rpc::context::RpcContext;
use crate::rpc::handlers;
use crate::rpc::registry::MethodRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broadcast::BroadcastManager;
use crate::websocket::event_bridge::EventBridge;
use crate::websocket::session::{ConnectionSlots, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connections, for event fan-out.
    pub broadcast: Arc<BroadcastManager>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// RPC method registry.
    pub registry: Arc<MethodRegistry>,
    /// Handler context without a connection.
    pub ctx: RpcContext,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Handshake authenticator.
    pub auth: Arc<dyn Authenticator>,
    /// Connection limit.
    pub slots: Arc<ConnectionSlots>,
    /// Prometheus handle, if a recorder was installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The gateway server.
pub struct GatewayServer {
    config: Arc<ServerConfig>,
    runtime: GatewayRuntime,
    registry: Arc<MethodRegistry>,
    ctx: RpcContext,
    broadcast: Arc<BroadcastManager>,
    shutdown: Arc<ShutdownCoordinator>,
    auth: Arc<dyn Authenticator>,
    slots: Arc<ConnectionSlots>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl GatewayServer {
    /// Create a server with every RPC method registered and the
    /// shared-secret authenticator from `config.auth`.
    pub fn new(config: ServerConfig, runtime: GatewayRuntime) -> Self {
        let mut registry = MethodRegistry::new();
        handlers::register_all(&mut registry);
        let ctx = RpcContext::new(runtime.clone(), registry.methods());
        let auth: Arc<dyn Authenticator> = Arc::new(SharedSecretAuth::from_settings(&config.auth));
        Self {
            slots: Arc::new(ConnectionSlots::new(config.max_connections)),
            config: Arc::new(config),
            runtime,
            registry: Arc::new(registry),
            ctx,
            broadcast: Arc::new(BroadcastManager::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            auth,
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Replace the authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// Serve `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            broadcast: Arc::clone(&self.broadcast),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            registry: Arc::clone(&self.registry),
            ctx: self.ctx.clone(),
            config: Arc::clone(&self.config),
            auth: Arc::clone(&self.auth),
            slots: Arc::clone(&self.slots),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind, then serve in the background along with the event bridge and
    /// runtime maintenance.
    pub async fn listen(self) -> io::Result<RunningServer> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let bridge = EventBridge::new(self.runtime.events.subscribe(), Arc::clone(&self.broadcast));
        let bridge_handle = tokio::spawn(bridge.run(token.clone()));
        let maintenance = self.runtime.spawn_maintenance(token.clone());

        let serve_token = token.clone();
        let server_handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(error = %err, "server error");
            }
        });

        info!(%local_addr, max_connections = self.config.max_connections, "gateway listening");
        Ok(RunningServer {
            local_addr,
            config: self.config,
            runtime: self.runtime,
            broadcast: self.broadcast,
            shutdown: self.shutdown,
            handles: vec![server_handle, bridge_handle, maintenance],
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runtime state.
    pub fn runtime(&self) -> &GatewayRuntime {
        &self.runtime
    }

    /// Broadcast manager.
    pub fn broadcast(&self) -> &Arc<BroadcastManager> {
        &self.broadcast
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Method registry.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }
}

/// A listening server.
pub struct RunningServer {
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
    runtime: GatewayRuntime,
    broadcast: Arc<BroadcastManager>,
    shutdown: Arc<ShutdownCoordinator>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Runtime state.
    pub fn runtime(&self) -> &GatewayRuntime {
        &self.runtime
    }

    /// Broadcast manager.
    pub fn broadcast(&self) -> &Arc<BroadcastManager> {
        &self.broadcast
    }

    /// Shutdown coordinator.
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Stop accepting, close every connection with 1001, and wait up to
    /// the configured drain timeout. Returns `false` if the drain timed out.
    pub async fn shutdown(self) -> bool {
        info!("gateway shutting down");
        self.broadcast.close_all().await;
        self.shutdown
            .graceful_shutdown(self.handles, Some(self.config.shutdown_timeout))
            .await
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let runtime = &state.ctx.runtime;
    let counts = GatewayCounts {
        connections: state.broadcast.connection_count().await,
        sessions: runtime.registry.len(),
        runs: runtime.registry.active_run_count(),
        pending_approvals: runtime.intents.pending_count(),
    };
    Json(HealthResponse::new(state.start_time, counts))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /ws
///
/// The connection slot is taken before the upgrade so a full server can
/// refuse with 1013 before any handshake traffic.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let slot = state.slots.try_acquire();
    let tracker = state.shutdown.sessions().clone();
    ws.max_message_size(state.config.max_payload_bytes)
        .on_upgrade(move |socket| tracker.track_future(run_ws_session(socket, state, slot)))
}
