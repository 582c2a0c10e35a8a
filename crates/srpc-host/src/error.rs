//! Host-level error types.

use srpc_transport::{ConnectionId, TransportError};

use crate::dispatcher::LifecyclePhase;
use crate::host::HostState;

/// Error type returned by user lifecycle callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a lifecycle signal for one connection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The id already maps to a live scope. The existing scope is untouched.
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// A user callback failed. The scope state change still happened.
    #[error("{phase} callback failed for connection {connection}: {source}")]
    Callback {
        phase: LifecyclePhase,
        connection: ConnectionId,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("cannot {action} host while it is {state}")]
    InvalidState {
        action: &'static str,
        state: HostState,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("shutdown incomplete: {pending} connection(s) still tearing down")]
    ShutdownIncomplete { pending: usize },
}
