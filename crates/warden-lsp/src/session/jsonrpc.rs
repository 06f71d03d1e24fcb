//! JSON-RPC 2.0 message types for LSP communication.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SessionError;

/// JSON-RPC code for a method the client does not implement.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Per-session request id allocator.
///
/// Ids start at 1 and are never reused for the lifetime of the session,
/// including across restarts of the server process.
#[derive(Debug)]
pub struct RequestIds(AtomicI64);

impl RequestIds {
    /// Creates an allocator whose first id is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicI64::new(1))
    }

    /// Allocates the next id.
    pub fn next_id(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always "2.0".
    pub jsonrpc: &'static str,
    /// Unique request identifier.
    pub id: i64,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a new request with a specific ID.
    #[must_use]
    pub fn with_id(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    /// Protocol version, always "2.0".
    pub jsonrpc: &'static str,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// Reply sent by the client to a server-initiated request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcReply {
    /// Protocol version, always "2.0".
    pub jsonrpc: &'static str,
    /// Identifier copied verbatim from the server request.
    pub id: Value,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcReply {
    /// Builds a reply from the handler outcome.
    #[must_use]
    pub fn new(id: Value, outcome: Result<Value, JsonRpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            jsonrpc: "2.0",
            id,
            result,
            error,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Error returned for server requests the client does not handle.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }
}

/// Message received from the server, classified by shape.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Response to one of our requests.
    Response {
        /// Integer id; `None` when the id was absent or not an integer.
        id: Option<i64>,
        /// Parsed outcome.
        outcome: Result<Value, SessionError>,
    },
    /// Request initiated by the server.
    ServerRequest {
        /// Id to echo in the reply.
        id: Value,
        /// Requested method.
        method: String,
        /// Parameters, `Null` when absent.
        params: Value,
    },
    /// Notification from the server.
    Notification {
        /// Notification method.
        method: String,
        /// Parameters, `Null` when absent.
        params: Value,
    },
}

impl IncomingMessage {
    /// Classifies a framed payload.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Protocol`] when the payload is not a JSON
    /// object or carries neither `method` nor `id`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|error| SessionError::protocol(format!("invalid JSON payload: {error}")))?;
        let Value::Object(mut object) = value else {
            return Err(SessionError::protocol("message is not a JSON object"));
        };

        let method = object.remove("method");
        let id = object.remove("id");
        let params = object.remove("params").unwrap_or(Value::Null);

        match (method, id) {
            (Some(Value::String(method)), Some(id)) => {
                Ok(Self::ServerRequest { id, method, params })
            }
            (Some(Value::String(method)), None) => Ok(Self::Notification { method, params }),
            (Some(_), _) => Err(SessionError::protocol("message method is not a string")),
            (None, Some(id)) => Ok(Self::Response {
                id: id.as_i64(),
                outcome: response_outcome(object.remove("result"), object.remove("error")),
            }),
            (None, None) => Err(SessionError::protocol(
                "message has neither a method nor an id",
            )),
        }
    }
}

fn response_outcome(result: Option<Value>, error: Option<Value>) -> Result<Value, SessionError> {
    match (result, error) {
        (_, Some(error)) if !error.is_null() => {
            match serde_json::from_value::<JsonRpcError>(error) {
                Ok(error) => Err(SessionError::from_jsonrpc(error)),
                Err(parse) => Err(SessionError::protocol(format!(
                    "malformed error object: {parse}"
                ))),
            }
        }
        (Some(result), _) => Ok(result),
        (None, _) => Err(SessionError::protocol(
            "response carried neither a result nor an error",
        )),
    }
}
