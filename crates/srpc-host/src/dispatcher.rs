//! LifecycleDispatcher: user callbacks for connect, ready and disconnect.
//!
//! Callbacks and scoped-service factories are registered during setup with
//! `&mut self`; once the dispatcher is handed to a host it is frozen in an
//! `Arc` and never mutated again.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use srpc_transport::{ConnectionId, DisconnectReason, LocalTarget};
use tracing::warn;

use crate::container::{ScopedFactories, ServiceContainer};
use crate::error::BoxError;

type ScopeCallback = Box<dyn Fn(&ServiceContainer) -> Result<(), BoxError> + Send + Sync>;
type DisconnectCallback =
    Box<dyn Fn(&ServiceContainer, &DisconnectReason) -> Result<(), BoxError> + Send + Sync>;

/// The three points in a connection's life where callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Connect,
    Ready,
    Disconnect,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Ready => "ready",
            Self::Disconnect => "disconnect",
        })
    }
}

/// Ordered lifecycle callbacks plus the scoped-service factories every
/// connection's container is built from.
#[derive(Default)]
pub struct LifecycleDispatcher {
    connect: Vec<ScopeCallback>,
    ready: Vec<ScopeCallback>,
    disconnect: Vec<DisconnectCallback>,
    factories: Arc<ScopedFactories>,
}

impl LifecycleDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` for every new connection, after its scope is registered.
    pub fn on_connect<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&ServiceContainer) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.connect.push(Box::new(callback));
        self
    }

    /// Run `callback` once a connection has completed its handshake.
    pub fn on_ready<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&ServiceContainer) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.ready.push(Box::new(callback));
        self
    }

    /// Run `callback` when a connection goes away, before its scope is disposed.
    pub fn on_disconnect<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&ServiceContainer, &DisconnectReason) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.disconnect.push(Box::new(callback));
        self
    }

    /// Register a per-connection service built by `factory` on first lookup.
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceContainer) -> T + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.factories).insert(factory);
        self
    }

    /// Register a local target: one instance per connection, built by
    /// `factory` and bound on the connection's registration during connect.
    ///
    /// The binding runs as a connect callback, so it is ordered with the
    /// other connect callbacks by registration order.
    pub fn add_local_target<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: LocalTarget,
        F: Fn(&ServiceContainer) -> T + Send + Sync + 'static,
    {
        self.add_scoped(factory);
        self.on_connect(|container| {
            let target = container.get::<T>().ok_or_else(|| {
                format!("local target {} could not be resolved", std::any::type_name::<T>())
            })?;
            container.registration().register_local_target(target);
            Ok(())
        })
    }

    /// [`add_local_target`](Self::add_local_target) using `T::default()`.
    pub fn add_default_local_target<T>(&mut self) -> &mut Self
    where
        T: LocalTarget + Default,
    {
        self.add_local_target(|_| T::default())
    }

    pub fn callback_count(&self, phase: LifecyclePhase) -> usize {
        match phase {
            LifecyclePhase::Connect => self.connect.len(),
            LifecyclePhase::Ready => self.ready.len(),
            LifecyclePhase::Disconnect => self.disconnect.len(),
        }
    }

    pub(crate) fn factories(&self) -> Arc<ScopedFactories> {
        self.factories.clone()
    }

    pub(crate) fn dispatch_connect(&self, container: &ServiceContainer) -> Result<(), BoxError> {
        run_all(
            LifecyclePhase::Connect,
            container.context().id(),
            self.connect.iter().map(|cb| guarded(|| cb(container))),
        )
    }

    pub(crate) fn dispatch_ready(&self, container: &ServiceContainer) -> Result<(), BoxError> {
        run_all(
            LifecyclePhase::Ready,
            container.context().id(),
            self.ready.iter().map(|cb| guarded(|| cb(container))),
        )
    }

    pub(crate) fn dispatch_disconnect(
        &self,
        container: &ServiceContainer,
        reason: &DisconnectReason,
    ) -> Result<(), BoxError> {
        run_all(
            LifecyclePhase::Disconnect,
            container.context().id(),
            self.disconnect.iter().map(|cb| guarded(|| cb(container, reason))),
        )
    }
}

impl fmt::Debug for LifecycleDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleDispatcher")
            .field("connect", &self.connect.len())
            .field("ready", &self.ready.len())
            .field("disconnect", &self.disconnect.len())
            .finish()
    }
}

/// Run one callback; a panic counts as a failure.
fn guarded(callback: impl FnOnce() -> Result<(), BoxError>) -> Result<(), BoxError> {
    std::panic::catch_unwind(AssertUnwindSafe(callback))
        .unwrap_or_else(|payload| Err(format!("callback panicked: {}", panic_message(&payload)).into()))
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

/// Drive every callback; the first failure is returned, later ones are logged.
fn run_all(
    phase: LifecyclePhase,
    connection: &ConnectionId,
    results: impl Iterator<Item = Result<(), BoxError>>,
) -> Result<(), BoxError> {
    let mut first = None;
    for (index, result) in results.enumerate() {
        let Err(e) = result else { continue };
        if first.is_none() {
            first = Some(e);
        } else {
            warn!(connection = %connection, %phase, index, error = %e, "lifecycle callback failed");
        }
    }
    first.map_or(Ok(()), Err)
}
