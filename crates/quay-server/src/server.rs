use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use quay_broker::{ConsumerManager, InMemoryBroker, ProducerManager};
use quay_core::messages::{LanguageCode, SendMessageRequest, SendMessageResponse};
use quay_core::{ClientId, ProxyError};
use quay_proxy::{
    CallContext, ChannelRegistry, ClientService, Correlator, ProducerService, RoundRobinSelector,
    SettingsCache, StreamHandle, TelemetryCommandManager,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::handlers::{self, HandlerState};
use crate::stream;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub max_send_queue: usize,
}

/// Client identity carried on the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub client_id: Option<String>,
    pub language: Option<String>,
    pub version: Option<i32>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Wire up every component from `config`.
pub fn build_state(config: &ProxyConfig) -> AppState {
    let send_timeout = Duration::from_millis(config.send_timeout_ms);
    let correlator = Arc::new(Correlator::new(send_timeout));
    let telemetry = Arc::new(TelemetryCommandManager::new());
    let settings = Arc::new(SettingsCache::new());
    let channels = Arc::new(ChannelRegistry::new(Arc::clone(&correlator), Arc::clone(&telemetry)));
    let producers = Arc::new(ProducerManager::new());
    let consumers = Arc::new(ConsumerManager::new());

    let clients = Arc::new(ClientService::new(
        settings.clone(),
        Arc::clone(&channels),
        Arc::clone(&producers),
        Arc::clone(&consumers),
        telemetry.clone(),
    ));

    let mut selector = RoundRobinSelector::new(&config.broker_name, &config.broker_addr, config.queue_nums);
    if !config.allowed_topics.is_empty() {
        selector = selector.with_allowed_topics(config.allowed_topics.iter().cloned());
    }
    let broker = Arc::new(InMemoryBroker::new(&config.broker_name));
    let producer = Arc::new(
        ProducerService::new(broker, Arc::clone(&correlator))
            .with_write_queue_selector(move |ctx, request| selector.select(ctx, request))
            .with_send_message_hook(log_send_outcome)
            .with_send_timeout(send_timeout)
            .with_call_deadline(Duration::from_millis(config.request_timeout_ms)),
    );

    AppState {
        handler_state: Arc::new(HandlerState {
            clients,
            producer,
            settings,
            telemetry,
            channels,
            producers,
            consumers,
            correlator,
        }),
        max_send_queue: config.max_send_queue,
    }
}

fn log_send_outcome(
    ctx: &CallContext,
    request: &SendMessageRequest,
    response: Option<&SendMessageResponse>,
    error: Option<&ProxyError>,
) {
    match (response, error) {
        (Some(response), _) => tracing::debug!(
            client_id = %ctx.client_id,
            messages = request.messages.len(),
            status = %response.status.code,
            "send completed"
        ),
        (None, Some(error)) => tracing::debug!(
            client_id = %ctx.client_id,
            messages = request.messages.len(),
            error_kind = error.error_kind(),
            "send failed"
        ),
        (None, None) => {}
    }
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ProxyConfig) -> Result<ServerHandle, std::io::Error> {
    let state = build_state(&config);
    let cancel = CancellationToken::new();

    let scavenger = state.handler_state.clients.start_scavenger(
        Duration::from_millis(config.scavenge_interval_ms),
        Duration::from_millis(config.client_idle_timeout_ms),
        cancel.clone(),
    );

    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, broker = %config.broker_name, "quay proxy started");

    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        let app = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        local_addr,
        cancel,
        server,
        scavenger,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive until shutdown.
pub struct ServerHandle {
    pub port: u16,
    pub local_addr: SocketAddr,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    scavenger: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for background tasks to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.scavenger.await;
        let mut server = self.server;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
            tracing::warn!("connections still open after shutdown grace, aborting");
            server.abort();
        }
        tracing::info!("quay proxy stopped");
    }
}

/// WebSocket upgrade handler. `client_id` is required; language and version are optional.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let Some(client_id) = params.client_id.filter(|id| !id.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "client_id query parameter is required").into_response();
    };
    let language = params
        .language
        .as_deref()
        .and_then(|l| l.parse::<LanguageCode>().ok())
        .unwrap_or_default();

    let (tx, rx) = mpsc::channel(state.max_send_queue);
    let ctx = CallContext::new(ClientId::from_raw(client_id), StreamHandle::new(tx))
        .with_remote_addr(peer.to_string())
        .with_language(language)
        .with_client_version(params.version.unwrap_or_default());

    tracing::info!(client_id = %ctx.client_id, remote_addr = %peer, language = %language, "client connected");
    let handler_state = state.handler_state;
    ws.on_upgrade(move |socket| stream::serve_connection(socket, ctx, rx, handler_state))
        .into_response()
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(handlers::health(&state.handler_state))
}
