//! ConnectionScope: the resources owned by one connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use srpc_transport::{ConnectionId, Registration, RequestContext};
use tracing::debug;

use crate::container::{ScopedFactories, ServiceContainer};

/// Registration, request context and service container of one connection.
///
/// The three are created together and released together: disposing the scope
/// drops every scoped service, unbinds every local target and disposes the
/// request context. Disposal is idempotent and also happens on drop.
pub struct ConnectionScope {
    id: ConnectionId,
    registration: Arc<Registration>,
    context: Arc<RequestContext>,
    container: ServiceContainer,
    ready: AtomicBool,
    disposed: AtomicBool,
}

impl ConnectionScope {
    pub(crate) fn new(
        registration: Arc<Registration>,
        context: Arc<RequestContext>,
        factories: Arc<ScopedFactories>,
    ) -> Self {
        let container = ServiceContainer::new(registration.clone(), context.clone(), factories);
        Self {
            id: context.id().clone(),
            registration,
            context,
            container,
            ready: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Returns `false` if the scope was already ready.
    pub(crate) fn mark_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::AcqRel)
    }

    /// Release everything this scope owns. Returns `true` only for the call
    /// that actually disposed it.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let services = self.container.dispose();
        let targets = self.registration.unbind_all();
        self.context.dispose();
        debug!(connection = %self.id, services, targets, "scope disposed");
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ConnectionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionScope")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
