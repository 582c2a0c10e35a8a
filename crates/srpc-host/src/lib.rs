//! srpc Host
//!
//! The session core of an srpc server:
//! - `ServiceContainer`: isolated per-connection service instances
//! - `ConnectionScope`: everything one connection owns, disposed together
//! - `SessionRegistry`: connection id → scope, driving connect/ready/disconnect
//! - `LifecycleDispatcher`: user callbacks and local-target factories
//! - `RpcHost`: start/run/stop orchestration over the WebSocket transport

pub mod container;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod registry;
pub mod scope;

pub use container::ServiceContainer;
pub use dispatcher::{LifecycleDispatcher, LifecyclePhase};
pub use error::{BoxError, HostError, SessionError};
pub use host::{HostConfig, HostState, RpcHost, timeout_from_millis};
pub use registry::SessionRegistry;
pub use scope::ConnectionScope;
