//! WebSocket transport server using Axum.
//!
//! Handles HTTP upgrade to WebSocket, the version handshake, per-connection
//! notification delivery and request routing through the connection's
//! [`Registration`]. Connection lifecycle is reported to a
//! [`SessionHandler`] at three points: when the socket opens, when the
//! handshake completes, and when the connection goes away.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Serialize;
use serde_json::json;
use srpc_protocol::{
    HandshakeParams, HandshakeRequiredParams, HandshakeResult, Notifications, ProtocolVersion,
    RpcError, RpcNotification, RpcRequest, RpcResponse,
};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::context::{ConnectionId, DisconnectReason, RequestContext};
use crate::registration::Registration;

/// Receives the lifecycle signals of every connection.
///
/// Calls for one connection are strictly ordered: `on_connecting`, then at
/// most one `on_ready`, then `on_disconnecting`. `on_ready` is only called
/// after a successful `on_connecting`; `on_disconnecting` is called even when
/// `on_connecting` failed, and receives the same context so a handler can tell
/// which connection is going away even if two reported the same id. The
/// transport waits for each call to return before moving that connection to
/// its next phase, so anything bound on the registration during
/// `on_connecting` is in place before the first request is read.
///
/// A panic inside any of the three is treated like an `Err`: a panicking
/// `on_connecting` rejects the connection and `on_disconnecting` still runs.
pub trait SessionHandler: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn on_connecting(
        &self,
        registration: Arc<Registration>,
        context: Arc<RequestContext>,
    ) -> Result<(), Self::Error>;

    fn on_ready(&self, id: &ConnectionId) -> Result<(), Self::Error>;

    fn on_disconnecting(
        &self,
        context: &RequestContext,
        reason: DisconnectReason,
    ) -> Result<(), Self::Error>;
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Protocol version this server speaks
    pub server_version: ProtocolVersion,
    /// Oldest client version accepted, if any
    pub min_client_version: Option<ProtocolVersion>,
    /// Shared secret required in the handshake, if any
    pub token: Option<String>,
    /// Time allowed to complete the handshake
    pub handshake_timeout_ms: u64,
    /// Enable permissive CORS
    pub enable_cors: bool,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Capacity of each connection's notification queue
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            hostname: "127.0.0.1".into(),
            server_version: ProtocolVersion::parse("1.0"),
            min_client_version: None,
            token: None,
            handshake_timeout_ms: 10_000,
            enable_cors: false,
            max_connections: Some(32),
            outbound_buffer: 256,
        }
    }
}

/// Errors raised by the transport itself.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("shutdown timed out with {pending} connection(s) still open")]
    ShutdownTimedOut { pending: usize },
}

/// Shared state for the transport server.
struct AppState<H: SessionHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    connection_count: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// The transport server: accepts WebSocket connections and drives their lifecycle.
pub struct TransportServer {
    shutdown: CancellationToken,
    /// Tracks the accept loop and every connection task
    tracker: TaskTracker,
    connection_count: Arc<AtomicUsize>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Start the transport server with the given session handler.
    pub async fn start<H: SessionHandler>(
        config: TransportConfig,
        handler: Arc<H>,
    ) -> Result<Self, TransportError> {
        Self::start_with_shutdown(config, handler, CancellationToken::new()).await
    }

    /// Start the transport server, stopping when `shutdown` is cancelled.
    pub async fn start_with_shutdown<H: SessionHandler>(
        config: TransportConfig,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<Self, TransportError> {
        let address = format!("{}:{}", config.hostname, config.port);
        let listener = tokio::net::TcpListener::bind((config.hostname.as_str(), config.port))
            .await
            .map_err(|source| TransportError::Bind {
                address: address.clone(),
                source,
            })?;
        let actual_port = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { address, source })?
            .port();

        let connection_count = Arc::new(AtomicUsize::new(0));
        let tracker = TaskTracker::new();

        let state = Arc::new(AppState {
            handler,
            config: config.clone(),
            connection_count: connection_count.clone(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        });

        let mut app = Router::new()
            .route("/ws", get(ws_upgrade_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .with_state(state);
        if config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }

        info!("transport listening on ws://{}:{}/ws", config.hostname, actual_port);

        let serve_shutdown = shutdown.clone();
        tracker.spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await;
            if let Err(e) = result {
                error!("transport accept loop failed: {e}");
            }
        });

        Ok(Self {
            shutdown,
            tracker,
            connection_count,
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections currently open, handshake complete or not.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Acquire)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting and tell every connection to unwind. Does not wait.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
    }

    /// Whether the accept loop and every connection task have finished.
    pub fn is_drained(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }

    /// Shut down and wait for connections to drain.
    ///
    /// `None` waits indefinitely; `Some(timeout)` gives up after `timeout`
    /// and reports how many connections were still open. Teardown of those
    /// connections continues in the background.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.begin_shutdown();

        match timeout {
            None => self.tracker.wait().await,
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
                    let pending = self.connection_count();
                    warn!(pending, "transport shutdown timed out after {timeout:?}");
                    return Err(TransportError::ShutdownTimedOut { pending });
                }
            }
        }

        info!("transport server stopped");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: SessionHandler>(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState<H>>>,
) -> Response {
    if state.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let max = state.config.max_connections;
    let Some(slot) = ConnectionSlot::acquire(&state.connection_count, max) else {
        warn!(?max, "connection rejected: connection limit reached");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    // A failed upgrade drops the callback, and the slot with it.
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(handle_ws_connection(socket, peer, state, slot))
    })
    .into_response()
}

async fn health_handler<H: SessionHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": if state.shutdown.is_cancelled() { "stopping" } else { "ok" },
        "connections": state.connection_count.load(Ordering::Acquire),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

type WsSink = SplitSink<WebSocket, Message>;

/// A reserved place under `max_connections`, released on drop.
struct ConnectionSlot {
    count: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    /// Reserve a slot, or `None` if `max` connections are already open.
    fn acquire(count: &Arc<AtomicUsize>, max: Option<usize>) -> Option<Self> {
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| match max {
                Some(max) if open >= max => None,
                _ => Some(open + 1),
            })
            .ok()?;
        Some(Self {
            count: count.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Delivers `on_disconnecting` for one connection exactly once. If the
/// connection task unwinds or is dropped before reporting a reason, the drop
/// reports it as a transport error.
struct Departure<H: SessionHandler> {
    handler: Arc<H>,
    context: Arc<RequestContext>,
    reported: bool,
}

impl<H: SessionHandler> Departure<H> {
    fn new(handler: Arc<H>, context: Arc<RequestContext>) -> Self {
        Self {
            handler,
            context,
            reported: false,
        }
    }

    fn report(&mut self, reason: DisconnectReason) {
        if std::mem::replace(&mut self.reported, true) {
            return;
        }
        let (handler, context) = (&self.handler, &self.context);
        if let Err(e) = guarded(|| handler.on_disconnecting(context, reason)) {
            warn!(connection = %context.id(), error = %e, "disconnect handler failed");
        }
    }
}

impl<H: SessionHandler> Drop for Departure<H> {
    fn drop(&mut self) {
        self.report(DisconnectReason::TransportError(
            "connection task ended unexpectedly".into(),
        ));
    }
}

/// Call into the session handler, turning a panic into an error.
fn guarded<E: std::fmt::Display>(call: impl FnOnce() -> Result<(), E>) -> Result<(), String> {
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(payload) => Err(format!("handler panicked: {}", panic_message(&payload))),
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn handle_ws_connection<H: SessionHandler>(
    socket: WebSocket,
    peer: SocketAddr,
    state: Arc<AppState<H>>,
    slot: ConnectionSlot,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(state.config.outbound_buffer);
    let context = Arc::new(RequestContext::new(ConnectionId::new(), outbound_tx).with_peer(peer));
    let registration = Arc::new(Registration::new(context.id().clone()));
    let id = context.id().clone();
    info!(connection = %id, %peer, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut departure = Departure::new(state.handler.clone(), context.clone());
    let connected = guarded(|| {
        state
            .handler
            .on_connecting(registration.clone(), context.clone())
    });
    let reason = match connected {
        Ok(()) => {
            run_connection(
                &mut ws_tx,
                &mut ws_rx,
                &mut outbound_rx,
                &context,
                &registration,
                &state,
            )
            .await
        }
        Err(e) => {
            error!(connection = %id, error = %e, "connect handler failed, closing connection");
            DisconnectReason::ConnectRejected
        }
    };

    departure.report(reason.clone());
    let _ = ws_tx.send(Message::Close(None)).await;

    drop(slot);
    let remaining = state.connection_count.load(Ordering::Acquire);
    info!(connection = %id, %reason, "client disconnected (total: {remaining})");
}

/// Drive one connection until it ends, returning why it ended.
async fn run_connection<H: SessionHandler>(
    ws_tx: &mut WsSink,
    ws_rx: &mut SplitStream<WebSocket>,
    outbound_rx: &mut mpsc::Receiver<String>,
    context: &RequestContext,
    registration: &Registration,
    state: &AppState<H>,
) -> DisconnectReason {
    let config = &state.config;
    let id = context.id();

    let required = RpcNotification::new(
        Notifications::HANDSHAKE_REQUIRED,
        serde_json::to_value(HandshakeRequiredParams {
            server_version: config.server_version.clone(),
            timeout: config.handshake_timeout_ms,
        })
        .ok(),
    );
    if let Err(e) = send_json(ws_tx, &required).await {
        return DisconnectReason::TransportError(e);
    }

    let mut negotiated = false;
    let handshake_deadline =
        tokio::time::Instant::now() + Duration::from_millis(config.handshake_timeout_ms);

    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !negotiated {
                            match handle_handshake(&text, config, context) {
                                HandshakeOutcome::Accepted(response) => {
                                    if let Err(e) = send_text(ws_tx, response).await {
                                        return DisconnectReason::TransportError(e);
                                    }
                                    negotiated = true;
                                    send_welcome(ws_tx, context, config).await;
                                    debug!(connection = %id, "handshake complete");
                                    if let Err(e) = guarded(|| state.handler.on_ready(id)) {
                                        warn!(connection = %id, error = %e, "ready handler failed");
                                    }
                                }
                                HandshakeOutcome::Rejected(response, reason) => {
                                    let _ = send_text(ws_tx, response).await;
                                    warn!(connection = %id, %reason, "handshake failed");
                                    return reason;
                                }
                                HandshakeOutcome::NotHandshake(response) => {
                                    let _ = send_text(ws_tx, response).await;
                                }
                            }
                            continue;
                        }

                        let Some(response) = handle_message(&text, registration).await else {
                            continue;
                        };
                        if let Err(e) = send_text(ws_tx, response).await {
                            error!(connection = %id, "failed to send response: {e}");
                            return DisconnectReason::TransportError(e);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %id, "client closed socket");
                        return DisconnectReason::ClientClosed;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, "websocket error: {e}");
                        return DisconnectReason::TransportError(e.to_string());
                    }
                    _ => {}
                }
            }

            // Notifications queued through the request context
            Some(notification) = outbound_rx.recv() => {
                if let Err(e) = send_text(ws_tx, notification).await {
                    error!(connection = %id, "failed to deliver notification: {e}");
                    return DisconnectReason::TransportError(e);
                }
            }

            _ = tokio::time::sleep_until(handshake_deadline), if !negotiated => {
                warn!(connection = %id, "handshake timeout");
                let err = RpcResponse::error(None, RpcError::handshake_timeout());
                let _ = send_json(ws_tx, &err).await;
                return DisconnectReason::HandshakeTimeout;
            }

            _ = context.cancelled() => {
                debug!(connection = %id, "context disposed, closing connection");
                return DisconnectReason::Disposed;
            }

            _ = state.shutdown.cancelled() => {
                let note = RpcNotification::new(Notifications::SERVER_SHUTTING_DOWN, None);
                let _ = send_json(ws_tx, &note).await;
                return DisconnectReason::ServerShutdown;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        error!(error = %e, "failed to serialize message");
        String::new()
    })
}

async fn send_text(ws_tx: &mut WsSink, text: String) -> Result<(), String> {
    ws_tx
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

async fn send_json<T: Serialize>(ws_tx: &mut WsSink, value: &T) -> Result<(), String> {
    send_text(ws_tx, to_json(value)).await
}

async fn send_welcome(ws_tx: &mut WsSink, context: &RequestContext, config: &TransportConfig) {
    let welcome = RpcNotification::new(
        Notifications::SERVER_CONNECTED,
        Some(json!({
            "connectionId": context.id().as_str(),
            "serverVersion": config.server_version,
            "protocolVersion": context.protocol_version(),
        })),
    );
    let _ = send_json(ws_tx, &welcome).await;
}

enum HandshakeOutcome {
    Accepted(String),
    Rejected(String, DisconnectReason),
    NotHandshake(String),
}

fn handle_handshake(
    text: &str,
    config: &TransportConfig,
    context: &RequestContext,
) -> HandshakeOutcome {
    let request = match RpcRequest::decode(text) {
        Ok(request) => request,
        Err(response) => return HandshakeOutcome::NotHandshake(to_json(&response)),
    };
    if !request.is_handshake() {
        let err = request.reject(RpcError::not_negotiated());
        return HandshakeOutcome::NotHandshake(to_json(&err));
    }

    let rejected = |error: RpcError, reason: DisconnectReason| {
        HandshakeOutcome::Rejected(to_json(&request.reject(error)), reason)
    };

    let params: HandshakeParams = match request.params_as() {
        Ok(params) => params,
        Err(e) => return rejected(e, DisconnectReason::HandshakeRejected),
    };

    if let Some(expected) = &config.token {
        if params.token.as_deref() != Some(expected.as_str()) {
            return rejected(RpcError::invalid_token(), DisconnectReason::HandshakeRejected);
        }
    }

    let negotiated = match ProtocolVersion::negotiate(
        &config.server_version,
        config.min_client_version.as_ref(),
        &params.version,
    ) {
        Ok(v) => v,
        Err(mismatch) => {
            return rejected(
                RpcError::version_mismatch(&mismatch),
                DisconnectReason::VersionMismatch,
            );
        }
    };

    if let Some(client) = &params.client {
        debug!(connection = %context.id(), client = %client.name, version = %params.version, "handshake");
    }
    context.set_protocol_version(negotiated.clone());

    let result = serde_json::to_value(HandshakeResult {
        connection_id: context.id().to_string(),
        server_version: config.server_version.clone(),
        negotiated_version: negotiated,
    })
    .map_err(|e| RpcError::internal(e.to_string()));
    HandshakeOutcome::Accepted(to_json(&RpcResponse::from_result(request.id.clone(), result)))
}

/// Route one post-handshake frame. Client notifications get no response.
async fn handle_message(text: &str, registration: &Registration) -> Option<String> {
    let mut request = match RpcRequest::decode(text) {
        Ok(request) => request,
        Err(response) => return Some(to_json(&response)),
    };

    if request.is_handshake() {
        let err = request.reject(RpcError::invalid_request("Handshake already completed"));
        return Some(to_json(&err));
    }

    debug!(connection = %registration.connection(), method = %request.method, "routing request");
    let result = registration.route(&request.method, request.params.take()).await;
    request.respond(result).map(|response| to_json(&response))
}
