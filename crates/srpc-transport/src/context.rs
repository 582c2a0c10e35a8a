//! Request context: identity and disposal of a single connection.
//!
//! Every accepted connection gets exactly one [`RequestContext`]. It carries
//! the connection identity used as the session key, the negotiated protocol
//! version once the handshake completes, and an outbound queue for
//! notifications addressed to this connection only. Disposing the context
//! cancels the connection: the transport observes the cancellation and
//! closes the socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use srpc_protocol::{ProtocolVersion, RpcNotification};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

/// Opaque identity of one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// A fresh random identity.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket.
    ClientClosed,
    /// Read or write on the socket failed.
    TransportError(String),
    /// Handshake refused (bad token or malformed params).
    HandshakeRejected,
    /// No handshake within the configured timeout.
    HandshakeTimeout,
    /// Client protocol version is not compatible.
    VersionMismatch,
    /// The connect handler failed.
    ConnectRejected,
    /// The connection's context was disposed server-side.
    Disposed,
    /// The server is shutting down.
    ServerShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::HandshakeRejected => f.write_str("handshake rejected"),
            Self::HandshakeTimeout => f.write_str("handshake timeout"),
            Self::VersionMismatch => f.write_str("version mismatch"),
            Self::ConnectRejected => f.write_str("connect rejected"),
            Self::Disposed => f.write_str("disposed"),
            Self::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

/// Per-connection identity and lifetime handle.
#[derive(Debug)]
pub struct RequestContext {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    connected_at: Instant,
    protocol_version: OnceLock<ProtocolVersion>,
    /// Serialized notifications queued for this connection's socket.
    outbound: Option<mpsc::Sender<String>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl RequestContext {
    /// Context for a live connection whose notifications go to `outbound`.
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<String>) -> Self {
        Self {
            outbound: Some(outbound),
            ..Self::detached(id)
        }
    }

    /// Context with no socket behind it. Notifications are dropped.
    pub fn detached(id: ConnectionId) -> Self {
        Self {
            id,
            peer: None,
            connected_at: Instant::now(),
            protocol_version: OnceLock::new(),
            outbound: None,
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// The version agreed during the handshake, once it has completed.
    pub fn protocol_version(&self) -> Option<&ProtocolVersion> {
        self.protocol_version.get()
    }

    /// Record the negotiated version. Only the first call has an effect.
    pub fn set_protocol_version(&self, version: ProtocolVersion) -> bool {
        self.protocol_version.set(version).is_ok()
    }

    /// Queue a notification for this connection.
    ///
    /// Returns `false` if the context is disposed, has no socket, or the
    /// outbound queue is full.
    pub fn notify(&self, method: &str, params: Option<serde_json::Value>) -> bool {
        if self.is_disposed() {
            return false;
        }
        let Some(tx) = &self.outbound else {
            debug!(connection = %self.id, method, "notification dropped: detached context");
            return false;
        };
        let json = match serde_json::to_string(&RpcNotification::new(method, params)) {
            Ok(json) => json,
            Err(e) => {
                warn!(connection = %self.id, method, error = %e, "failed to serialize notification");
                return false;
            }
        };
        tx.try_send(json).is_ok()
    }

    /// Dispose the context and cancel the connection. Idempotent; returns
    /// `true` only for the call that actually disposed it.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Resolves once the context has been disposed.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token cancelled on disposal, for work that outlives a borrow of the context.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(ConnectionId::from("c1").as_str(), "c1");
        assert_eq!(ConnectionId::from("c1").to_string(), "c1");
    }

    #[test]
    fn dispose_is_idempotent_and_cancels() {
        let ctx = RequestContext::detached("c1".into());
        let token = ctx.cancellation_token();
        assert!(!ctx.is_disposed());
        assert!(ctx.dispose());
        assert!(!ctx.dispose());
        assert!(ctx.is_disposed());
        assert!(token.is_cancelled());
    }

    #[test]
    fn protocol_version_is_set_once() {
        let ctx = RequestContext::detached("c1".into());
        assert!(ctx.protocol_version().is_none());
        assert!(ctx.set_protocol_version(ProtocolVersion::parse("1.2")));
        assert!(!ctx.set_protocol_version(ProtocolVersion::parse("9.9")));
        assert_eq!(ctx.protocol_version().unwrap().as_str(), "1.2");
    }

    #[tokio::test]
    async fn notify_queues_serialized_notification() {
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = RequestContext::new("c1".into(), tx);
        assert!(ctx.notify("session/ready", Some(serde_json::json!({"n": 1}))));

        let msg = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["method"], "session/ready");
        assert_eq!(parsed["params"]["n"], 1);
    }

    #[test]
    fn notify_fails_when_detached_disposed_or_full() {
        let detached = RequestContext::detached("c1".into());
        assert!(!detached.notify("x/y", None));

        let (tx, _rx) = mpsc::channel(1);
        let ctx = RequestContext::new("c2".into(), tx);
        assert!(ctx.notify("x/y", None));
        assert!(!ctx.notify("x/y", None));

        let (tx, _rx) = mpsc::channel(4);
        let ctx = RequestContext::new("c3".into(), tx);
        ctx.dispose();
        assert!(!ctx.notify("x/y", None));
    }

    #[tokio::test]
    async fn cancelled_resolves_after_dispose() {
        let ctx = std::sync::Arc::new(RequestContext::detached("c1".into()));
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.cancelled().await;
                true
            })
        };
        ctx.dispose();
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn disconnect_reason_display() {
        assert_eq!(DisconnectReason::ClientClosed.to_string(), "client closed");
        assert_eq!(
            DisconnectReason::TransportError("reset".into()).to_string(),
            "transport error: reset"
        );
    }
}
