//! srpc Transport Layer
//!
//! WebSocket server with version handshake, per-connection request context
//! and per-connection routing of requests to bound local targets.

pub mod context;
pub mod registration;
pub mod server;

pub use context::{ConnectionId, DisconnectReason, RequestContext};
pub use registration::{LocalTarget, Registration};
pub use server::{SessionHandler, TransportConfig, TransportError, TransportServer};
