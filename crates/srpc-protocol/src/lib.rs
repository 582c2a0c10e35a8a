//! SRPC - Protocol Types
//!
//! JSON-RPC 2.0 compatible types for the scoped RPC host.
//! This crate is the single source of truth for the wire types, the
//! handshake exchange, error codes and protocol version ordering.

pub mod error;
pub mod handshake;
pub mod jsonrpc;
pub mod methods;
pub mod version;

pub use error::{RpcError, RpcErrorCode};
pub use handshake::{
    HandshakeClientInfo, HandshakeErrorCode, HandshakeParams, HandshakeRequiredParams,
    HandshakeResult,
};
pub use jsonrpc::{
    HandlerResult, JSONRPC_VERSION, RequestId, RpcNotification, RpcOutcome, RpcRequest,
    RpcResponse,
};
pub use methods::{Methods, Notifications};
pub use version::{ProtocolVersion, VersionMismatch};
