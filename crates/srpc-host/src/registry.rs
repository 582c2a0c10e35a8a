//! SessionRegistry: connection id → [`ConnectionScope`].
//!
//! The registry is the only owner of the id map. Insert and remove for one id
//! go through `DashMap`'s entry API, so a connect and a disconnect racing on
//! the same id cannot both observe it absent or both remove it. Lifecycle
//! callbacks run after the map operation, outside any shard lock.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use srpc_transport::{ConnectionId, DisconnectReason, Registration, RequestContext, SessionHandler};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{LifecycleDispatcher, LifecyclePhase};
use crate::error::SessionError;
use crate::scope::ConnectionScope;

pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Arc<ConnectionScope>>,
    dispatcher: Arc<LifecycleDispatcher>,
}

impl SessionRegistry {
    pub fn new(dispatcher: Arc<LifecycleDispatcher>) -> Self {
        Self {
            sessions: DashMap::new(),
            dispatcher,
        }
    }

    /// Register a new connection and run the connect callbacks.
    ///
    /// If the id is already registered the new scope is disposed and
    /// [`SessionError::DuplicateConnection`] is returned; the existing scope
    /// is left alone. A failing connect callback is reported as
    /// [`SessionError::Callback`] but the scope stays registered until the
    /// matching disconnect.
    pub fn connect(
        &self,
        registration: Arc<Registration>,
        context: Arc<RequestContext>,
    ) -> Result<Arc<ConnectionScope>, SessionError> {
        let id = context.id().clone();
        let scope = Arc::new(ConnectionScope::new(
            registration,
            context,
            self.dispatcher.factories(),
        ));

        let inserted = match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(scope.clone());
                true
            }
        };
        if !inserted {
            error!(connection = %id, "connection id already registered, refusing connect");
            scope.dispose();
            return Err(SessionError::DuplicateConnection(id));
        }

        info!(connection = %id, sessions = self.sessions.len(), "session opened");

        self.dispatcher
            .dispatch_connect(scope.container())
            .map_err(|source| SessionError::Callback {
                phase: LifecyclePhase::Connect,
                connection: id,
                source,
            })?;
        Ok(scope)
    }

    /// Mark a connection ready and run the ready callbacks.
    ///
    /// Unknown ids are ignored: the connection may already be gone.
    pub fn ready(&self, id: &ConnectionId) -> Result<(), SessionError> {
        let Some(scope) = self.get(id) else {
            debug!(connection = %id, "ready for unknown connection ignored");
            return Ok(());
        };
        if !scope.mark_ready() {
            debug!(connection = %id, "connection already ready");
            return Ok(());
        }

        self.dispatcher
            .dispatch_ready(scope.container())
            .map_err(|source| SessionError::Callback {
                phase: LifecyclePhase::Ready,
                connection: id.clone(),
                source,
            })
    }

    /// Remove a connection, run the disconnect callbacks, then dispose its
    /// scope whatever the callbacks returned.
    ///
    /// Unknown ids are ignored.
    pub fn disconnect(&self, id: &ConnectionId, reason: DisconnectReason) -> Result<(), SessionError> {
        match self.sessions.remove(id) {
            Some((_, scope)) => self.close(scope, reason),
            None => {
                debug!(connection = %id, "disconnect for unknown connection ignored");
                Ok(())
            }
        }
    }

    /// Like [`disconnect`](Self::disconnect), but only removes the scope
    /// built around `context`.
    fn disconnect_context(
        &self,
        context: &RequestContext,
        reason: DisconnectReason,
    ) -> Result<(), SessionError> {
        let removed = self.sessions.remove_if(context.id(), |_, scope| {
            std::ptr::eq(Arc::as_ptr(scope.context()), context)
        });
        match removed {
            Some((_, scope)) => self.close(scope, reason),
            None => {
                debug!(connection = %context.id(), "no session to close");
                Ok(())
            }
        }
    }

    fn close(&self, scope: Arc<ConnectionScope>, reason: DisconnectReason) -> Result<(), SessionError> {
        let result = self.dispatcher.dispatch_disconnect(scope.container(), &reason);
        scope.dispose();
        info!(connection = %scope.id(), %reason, sessions = self.sessions.len(), "session closed");

        result.map_err(|source| SessionError::Callback {
            phase: LifecyclePhase::Disconnect,
            connection: scope.id().clone(),
            source,
        })
    }

    /// Disconnect every registered connection. Returns how many were closed.
    pub fn dispose_all(&self, reason: DisconnectReason) -> usize {
        let mut closed = 0;
        for id in self.connection_ids() {
            let Some((_, scope)) = self.sessions.remove(&id) else {
                continue;
            };
            closed += 1;
            if let Err(e) = self.close(scope, reason.clone()) {
                warn!(connection = %id, error = %e, "disconnect failed during teardown");
            }
        }
        closed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionScope>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Snapshot of the registered ids, in no particular order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionHandler for SessionRegistry {
    type Error = SessionError;

    fn on_connecting(
        &self,
        registration: Arc<Registration>,
        context: Arc<RequestContext>,
    ) -> Result<(), SessionError> {
        self.connect(registration, context).map(|_| ())
    }

    fn on_ready(&self, id: &ConnectionId) -> Result<(), SessionError> {
        self.ready(id)
    }

    fn on_disconnecting(
        &self,
        context: &RequestContext,
        reason: DisconnectReason,
    ) -> Result<(), SessionError> {
        self.disconnect_context(context, reason)
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
