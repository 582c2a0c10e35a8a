//! Error objects sent back to clients.
//!
//! Codes follow JSON-RPC 2.0 for malformed traffic and routing failures;
//! handshake failures use the reserved -32010..-32014 block from
//! [`HandshakeErrorCode`].

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::handshake::HandshakeErrorCode;
use crate::version::VersionMismatch;

/// The error codes a host can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Handshake(HandshakeErrorCode),
    /// Application-defined code from a local target.
    Custom(i32),
}

impl RpcErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::Handshake(code) => code.code(),
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            c => HandshakeErrorCode::from_code(c).map_or(Self::Custom(c), Self::Handshake),
        }
    }
}

impl From<HandshakeErrorCode> for RpcErrorCode {
    fn from(code: HandshakeErrorCode) -> Self {
        Self::Handshake(code)
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: impl Into<RpcErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into().code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(RpcErrorCode::MethodNotFound, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InternalError, message)
    }

    /// A request arrived before `rpc/handshake` succeeded.
    pub fn not_negotiated() -> Self {
        Self::new(
            HandshakeErrorCode::NotNegotiated,
            "Handshake required. Send rpc/handshake first.",
        )
    }

    pub fn invalid_token() -> Self {
        Self::new(HandshakeErrorCode::InvalidToken, "Invalid token")
    }

    pub fn handshake_timeout() -> Self {
        Self::new(HandshakeErrorCode::HandshakeTimeout, "Handshake timeout")
    }

    /// Carries the server and minimum versions so the client can tell what
    /// it would have to speak.
    pub fn version_mismatch(mismatch: &VersionMismatch) -> Self {
        Self::new(HandshakeErrorCode::VersionMismatch, mismatch.to_string()).with_data(json!({
            "serverVersion": mismatch.server,
            "minimumVersion": mismatch.minimum,
        }))
    }

    pub fn error_code(&self) -> RpcErrorCode {
        RpcErrorCode::from_code(self.code)
    }
}
