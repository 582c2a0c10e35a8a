//! Handshake types for protocol version negotiation.
//!
//! Protocol flow:
//!   1. Client connects to ws://host:port/ws
//!   2. Server sends: { method: "rpc/handshakeRequired", params: { serverVersion, timeout } }
//!   3. Client sends: { method: "rpc/handshake", id: "...", params: { version, token?, client? } }
//!   4. Server checks the version (and token, if configured) and responds
//!   5. Server sends "server/connected"; normal JSON-RPC traffic begins

use serde::{Deserialize, Serialize};

use crate::version::ProtocolVersion;

// ─────────────────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────────────────

/// Client information sent during handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeClientInfo {
    /// Client type identifier
    pub name: String,
    /// Client build version, informational only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Parameters for the rpc/handshake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeParams {
    /// Protocol version the client speaks
    #[serde(default)]
    pub version: ProtocolVersion,
    /// Shared secret, required only when the server is configured with one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Optional client information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<HandshakeClientInfo>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for the rpc/handshakeRequired notification (sent on connect).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequiredParams {
    #[serde(rename = "serverVersion")]
    pub server_version: ProtocolVersion,
    /// Milliseconds until a connection without a handshake is closed
    pub timeout: u64,
}

/// Successful handshake response result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResult {
    /// Connection identity assigned by the server
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "serverVersion")]
    pub server_version: ProtocolVersion,
    /// Version both sides agreed to speak (the lower of the two)
    #[serde(rename = "negotiatedVersion")]
    pub negotiated_version: ProtocolVersion,
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Handshake-specific error codes (-32010 to -32019).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeErrorCode {
    /// Request sent before the handshake completed
    NotNegotiated,
    /// Invalid or missing token
    InvalidToken,
    /// Handshake timed out
    HandshakeTimeout,
    /// Connection rejected (limit reached, server stopping)
    ConnectionRejected,
    /// Client protocol version is not compatible with the server's
    VersionMismatch,
}

impl HandshakeErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::NotNegotiated => -32010,
            Self::InvalidToken => -32011,
            Self::HandshakeTimeout => -32012,
            Self::ConnectionRejected => -32013,
            Self::VersionMismatch => -32014,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32010 => Some(Self::NotNegotiated),
            -32011 => Some(Self::InvalidToken),
            -32012 => Some(Self::HandshakeTimeout),
            -32013 => Some(Self::ConnectionRejected),
            -32014 => Some(Self::VersionMismatch),
            _ => None,
        }
    }
}
