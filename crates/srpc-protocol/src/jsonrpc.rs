//! JSON-RPC 2.0 frames as they travel over a connection.
//!
//! Inbound text goes through [`RpcRequest::decode`], which yields either a
//! well-formed request or the error response its sender should get back.
//! Everything the host writes is an [`RpcResponse`] or an [`RpcNotification`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;
use crate::methods::{Methods, namespace_of};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request ID: either a string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// An inbound call. Without an `id` it is a client notification and gets no
/// response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Fields of an inbound frame before they are checked.
#[derive(Deserialize)]
struct Envelope {
    jsonrpc: Option<Value>,
    id: Option<Value>,
    method: Option<Value>,
    params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Decode one text frame.
    ///
    /// Malformed JSON answers with a parse error and a null id. Anything that
    /// is JSON but not a JSON-RPC 2.0 request answers with an invalid-request
    /// error, echoing the frame's id when it has a usable one.
    pub fn decode(text: &str) -> Result<Self, RpcResponse> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            RpcResponse::error(None, RpcError::parse_error(format!("Invalid JSON: {e}")))
        })?;
        let envelope: Envelope = serde_json::from_value(value).map_err(|_| {
            RpcResponse::error(None, RpcError::invalid_request("Request must be a JSON object"))
        })?;

        let id = envelope.id.and_then(|id| serde_json::from_value(id).ok());
        let jsonrpc = envelope.jsonrpc.as_ref().and_then(Value::as_str);
        let method = envelope
            .method
            .as_ref()
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty());

        match (jsonrpc, method) {
            (Some(JSONRPC_VERSION), Some(method)) => Ok(Self {
                jsonrpc: JSONRPC_VERSION.into(),
                id,
                method: method.to_string(),
                params: envelope.params,
            }),
            _ => Err(RpcResponse::error(
                id,
                RpcError::invalid_request("Invalid JSON-RPC 2.0 request"),
            )),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_handshake(&self) -> bool {
        self.method == Methods::HANDSHAKE
    }

    pub fn namespace(&self) -> &str {
        namespace_of(&self.method)
    }

    /// Deserialize `params` into `T`; absent params are read as `null`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        T::deserialize(self.params.as_ref().unwrap_or(&Value::Null))
            .map_err(|e| RpcError::invalid_params(format!("Invalid params for {}: {e}", self.method)))
    }

    /// Response to this request carrying `result`, or `None` for a notification.
    pub fn respond(&self, result: HandlerResult) -> Option<RpcResponse> {
        self.id
            .as_ref()
            .map(|id| RpcResponse::from_result(Some(id.clone()), result))
    }

    /// Error response to this request, sent even for notifications.
    pub fn reject(&self, error: RpcError) -> RpcResponse {
        RpcResponse::error(self.id.clone(), error)
    }
}

/// Either half of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(Value),
    Error(RpcError),
}

/// JSON-RPC 2.0 response. `id` is null only when the request's id could not
/// be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self::from_result(Some(id.into()), Ok(result))
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self::from_result(id, Err(error))
    }

    pub fn from_result(id: Option<RequestId>, result: HandlerResult) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            outcome: match result {
                Ok(value) => RpcOutcome::Result(value),
                Err(error) => RpcOutcome::Error(error),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, RpcOutcome::Error(_))
    }

    pub fn into_result(self) -> HandlerResult {
        match self.outcome {
            RpcOutcome::Result(value) => Ok(value),
            RpcOutcome::Error(error) => Err(error),
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

/// Result from a local target handler.
pub type HandlerResult = Result<Value, RpcError>;
