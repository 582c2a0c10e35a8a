//! RpcHost: start/run/stop orchestration.
//!
//! The host owns the frozen [`LifecycleDispatcher`], the [`SessionRegistry`]
//! built from it, and while running, the [`TransportServer`] driving the
//! registry. Shutdown is coordinated through a `CancellationToken`: stopping
//! the host cancels it, the transport stops accepting, and every connection
//! unwinds through the registry's disconnect path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use srpc_transport::{DisconnectReason, TransportConfig, TransportError, TransportServer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::LifecycleDispatcher;
use crate::error::HostError;
use crate::registry::SessionRegistry;

/// Default time allowed for connections to drain on stop.
const DEFAULT_SHUTDOWN_TIMEOUT_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        })
    }
}

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub transport: TransportConfig,
    /// How long `run` waits for connections to drain; negative waits forever.
    pub shutdown_timeout_ms: i64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl HostConfig {
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.shutdown_timeout_ms)
    }
}

/// Milliseconds to a wait bound: negative means no bound.
pub fn timeout_from_millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

struct Lifecycle {
    state: HostState,
    shutdown: CancellationToken,
    transport: Option<Arc<TransportServer>>,
}

pub struct RpcHost {
    config: HostConfig,
    registry: Arc<SessionRegistry>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl RpcHost {
    /// Build a host. The dispatcher is frozen from here on.
    pub fn new(config: HostConfig, dispatcher: LifecycleDispatcher) -> Self {
        let registry = Arc::new(SessionRegistry::new(Arc::new(dispatcher)));
        Self {
            config,
            registry,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: HostState::Stopped,
                shutdown: CancellationToken::new(),
                transport: None,
            })),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn state(&self) -> HostState {
        self.lifecycle.lock().state
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bound port while running.
    pub fn port(&self) -> Option<u16> {
        self.lifecycle.lock().transport.as_ref().map(|t| t.port())
    }

    /// Token cancelled when the host begins stopping. Cancelling it asks a
    /// running host to stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.lifecycle.lock().shutdown.clone()
    }

    pub async fn start(&self) -> Result<(), HostError> {
        self.start_with_cancellation(CancellationToken::new()).await
    }

    /// Start accepting connections. Cancelling `cancel` stops the transport.
    pub async fn start_with_cancellation(&self, cancel: CancellationToken) -> Result<(), HostError> {
        let shutdown = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != HostState::Stopped {
                return Err(HostError::InvalidState {
                    action: "start",
                    state: lifecycle.state,
                });
            }
            lifecycle.state = HostState::Starting;
            lifecycle.shutdown = cancel.child_token();
            lifecycle.shutdown.clone()
        };

        let started = TransportServer::start_with_shutdown(
            self.config.transport.clone(),
            self.registry.clone(),
            shutdown,
        )
        .await;

        let mut lifecycle = self.lifecycle.lock();
        match started {
            Ok(server) => {
                info!(port = server.port(), "host started");
                lifecycle.transport = Some(Arc::new(server));
                lifecycle.state = HostState::Running;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "host failed to start");
                lifecycle.state = HostState::Stopped;
                Err(e.into())
            }
        }
    }

    pub async fn run(&self) -> Result<(), HostError> {
        self.run_with_cancellation(CancellationToken::new()).await
    }

    /// Start if needed, wait until cancelled, then stop with the configured
    /// shutdown timeout.
    pub async fn run_with_cancellation(&self, cancel: CancellationToken) -> Result<(), HostError> {
        if self.state() == HostState::Stopped {
            self.start_with_cancellation(cancel.clone()).await?;
        }

        let shutdown = self.shutdown_token();
        tokio::select! {
            _ = cancel.cancelled() => debug!("host cancelled"),
            _ = shutdown.cancelled() => debug!("host shutdown requested"),
        }

        self.stop(self.config.shutdown_timeout()).await
    }

    /// Stop with a millisecond timeout; negative waits indefinitely.
    pub async fn stop_millis(&self, timeout_ms: i64) -> Result<(), HostError> {
        self.stop(timeout_from_millis(timeout_ms)).await
    }

    /// Stop accepting connections and wait for the open ones to tear down.
    ///
    /// `None` waits indefinitely. If `timeout` elapses first,
    /// [`HostError::ShutdownIncomplete`] is returned and teardown finishes in
    /// the background; the host reports `Stopping` until it does. Stopping a
    /// host that is not running is a no-op.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), HostError> {
        let transport = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                HostState::Stopped => {
                    debug!("stop on a stopped host");
                    return Ok(());
                }
                HostState::Starting => {
                    return Err(HostError::InvalidState {
                        action: "stop",
                        state: HostState::Starting,
                    });
                }
                HostState::Running => {
                    info!(?timeout, "host stopping");
                    lifecycle.state = HostState::Stopping;
                    lifecycle.shutdown.cancel();
                }
                HostState::Stopping => {}
            }
            lifecycle.transport.clone()
        };

        let Some(transport) = transport else {
            self.lifecycle.lock().state = HostState::Stopped;
            return Ok(());
        };

        match transport.shutdown(timeout).await {
            Ok(()) => {
                finish_stop(&self.lifecycle, &transport, &self.registry);
                Ok(())
            }
            Err(TransportError::ShutdownTimedOut { pending }) => {
                warn!(pending, "host shutdown incomplete, teardown continues in background");
                let lifecycle = self.lifecycle.clone();
                let registry = self.registry.clone();
                tokio::spawn(async move {
                    if transport.shutdown(None).await.is_ok() {
                        finish_stop(&lifecycle, &transport, &registry);
                    }
                });
                Err(HostError::ShutdownIncomplete { pending })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Settle the host as stopped once `transport` has drained.
fn finish_stop(
    lifecycle: &Mutex<Lifecycle>,
    transport: &Arc<TransportServer>,
    registry: &SessionRegistry,
) {
    let leftover = registry.dispose_all(DisconnectReason::ServerShutdown);
    if leftover > 0 {
        warn!(leftover, "sessions still registered after drain were disposed");
    }

    let mut lifecycle = lifecycle.lock();
    let current = lifecycle
        .transport
        .as_ref()
        .is_some_and(|t| Arc::ptr_eq(t, transport));
    if current && lifecycle.state == HostState::Stopping {
        lifecycle.state = HostState::Stopped;
        lifecycle.transport = None;
        info!("host stopped");
    }
}

impl fmt::Debug for RpcHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHost")
            .field("state", &self.state())
            .field("port", &self.port())
            .field("sessions", &self.registry.len())
            .finish()
    }
}
