//! Connection handlers for Chatter server.
//!
//! This module admits WebSocket connections, hands them to the hub and serves
//! the small read-only HTTP surface.

use crate::config::{Config, CorsConfig, IdentityConfig, RateLimitConfig};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredSink, MeteredStream};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chatter_core::{Connection, Hub, HubHandle, Identity};
use chatter_protocol::notification::SYSTEM_USERNAME;
use chatter_transport::websocket;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::GovernorLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error, info, warn};

/// How often idle rate-limiter keys are pruned.
const RATE_LIMIT_CLEANUP: Duration = Duration::from_secs(60);

/// Shared server state.
pub struct AppState {
    /// Handle to the delivery hub.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    /// Open WebSocket connections.
    pub active: Arc<AtomicUsize>,
    /// Connection tasks, awaited on shutdown.
    pub tasks: TaskTracker,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, hub: HubHandle) -> Self {
        Self {
            hub,
            config,
            active: Arc::new(AtomicUsize::new(0)),
            tasks: TaskTracker::new(),
        }
    }
}

/// Identity passed as query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct IdentityParams {
    pub user_id: Option<String>,
    pub username: Option<String>,
}

/// Resolve the caller's identity from trusted headers, falling back to query
/// parameters when allowed.
///
/// The reserved server username is never accepted.
#[must_use]
pub fn extract_identity(
    headers: &HeaderMap,
    params: &IdentityParams,
    config: &IdentityConfig,
) -> Option<Identity> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let query = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| config.allow_query && !value.is_empty())
            .map(str::to_string)
    };

    let user_id = header(&config.user_id_header).or_else(|| query(&params.user_id))?;
    let username = header(&config.username_header)
        .or_else(|| query(&params.username))
        .filter(|name| !name.eq_ignore_ascii_case(SYSTEM_USERNAME))?;
    let user_id = user_id.parse::<u64>().ok()?;

    Some(Identity::new(user_id, username))
}

/// Build the HTTP router with its CORS and rate limiting layers.
///
/// Rate limiting keys on the peer address, so the router must be served with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
///
/// # Errors
///
/// Returns an error if the CORS or rate limit configuration is invalid.
pub fn router(state: Arc<AppState>, shutdown: &CancellationToken) -> Result<Router> {
    let ws_path = state.config.transport.websocket_path.clone();
    let cors = cors_layer(&state.config.cors)?;
    let rate_limit = state.config.rate_limit.clone();

    let app = Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/users/online", get(online_users_handler))
        .with_state(state);

    Ok(with_rate_limit(app, &rate_limit, shutdown)?.layer(cors))
}

fn cors_layer(config: &CorsConfig) -> Result<CorsLayer> {
    let origins = if config.allowed_origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        let origins = config
            .allowed_origins
            .iter()
            .map(|origin| origin.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid CORS origin")?;
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(86_400)))
}

fn with_rate_limit(app: Router, config: &RateLimitConfig, shutdown: &CancellationToken) -> Result<Router> {
    if !config.enabled {
        return Ok(app);
    }

    let replenish_ms = (1_000 / config.per_second.max(1)).max(1);
    let governor = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_millisecond(replenish_ms)
            .burst_size(config.burst)
            .finish()
            .context("Invalid rate limit configuration")?,
    );

    let limiter = governor.limiter().clone();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(RATE_LIMIT_CLEANUP) => limiter.retain_recent(),
            }
        }
    });

    Ok(app.layer(GovernorLayer { config: governor }))
}

/// Run the HTTP/WebSocket server until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal.cancel();
    });

    serve(config, listener, shutdown).await
}

/// Serve on an already-bound listener until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the HTTP server fails.
pub async fn serve(config: Config, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let (hub, handle) = Hub::new(config.hub_config(), shutdown.child_token());
    let hub_task = tokio::spawn(hub.run());

    if config.metrics.enabled {
        tokio::spawn(metrics::report_hub_stats(
            handle.clone(),
            std::time::Duration::from_millis(config.metrics.report_interval_ms),
            shutdown.clone(),
        ));
    }

    let grace = config.shutdown_grace();
    let state = Arc::new(AppState::new(config, handle.clone()));
    let tasks = state.tasks.clone();
    let ws_path = state.config.transport.websocket_path.clone();
    let app = router(state, &shutdown)?;

    let addr = listener.local_addr()?;
    info!("Chatter server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    let stop = shutdown.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .context("HTTP server failed")?;

    handle.shutdown();
    let deadline = Instant::now() + grace;
    match timeout_at(deadline, hub_task).await {
        Ok(Ok(())) => info!("Hub stopped"),
        Ok(Err(e)) => error!("Hub task failed: {}", e),
        Err(_) => warn!(grace_ms = grace.as_millis() as u64, "Hub did not stop within grace period"),
    }

    tasks.close();
    match timeout_at(deadline, tasks.wait()).await {
        Ok(()) => debug!("All connection tasks finished"),
        Err(_) => warn!(remaining = tasks.len(), "Connection tasks still running after grace period"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = ?e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.active.load(Ordering::Relaxed);
    Json(json!({
        "status": if state.hub.is_shutting_down() { "shutting_down" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "connections": connections,
    }))
}

/// Presence handler.
async fn online_users_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.online_users().await {
        Ok(users) => Json(json!({ "users": users, "count": users.len() })).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<IdentityParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.hub.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server shutting down").into_response();
    }

    let Some(identity) = extract_identity(&headers, &params, &state.config.identity) else {
        debug!("Rejected WebSocket upgrade without identity");
        metrics::record_error("unauthorized");
        return (StatusCode::UNAUTHORIZED, "Missing user identity").into_response();
    };

    let Some(slot) = ConnectionMetricsGuard::try_acquire(&state.active, state.config.limits.max_connections)
    else {
        warn!(username = %identity.username, "Connection limit reached");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| {
            let tasks = state.tasks.clone();
            tasks.track_future(handle_websocket(socket, identity, slot, state))
        })
}

/// Handle an upgraded WebSocket connection. `_slot` holds its admission
/// reservation until the connection ends.
async fn handle_websocket(
    socket: WebSocket,
    identity: Identity,
    _slot: ConnectionMetricsGuard,
    state: Arc<AppState>,
) {

    let (sink, stream) = websocket::split(socket);
    let connection = Connection::new(
        identity,
        MeteredSink::new(sink),
        MeteredStream::new(stream),
        state.hub.clone(),
        state.config.connection_config(),
    );
    let id = connection.id();
    let username = connection.identity().username.clone();

    info!(connection = %id, username = %username, "WebSocket connected");

    if let Err(e) = connection.run().await {
        warn!(connection = %id, username = %username, error = %e, "Connection refused by hub");
        metrics::record_error("register");
    }

    info!(connection = %id, username = %username, "WebSocket disconnected");
}
