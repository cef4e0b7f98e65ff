//! JSON-RPC 2.0 protocol types for the media server connection

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    pub params: Value,

    /// Request ID for matching with response (absent for notifications)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i64,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A message received from the media server
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Successful reply to a request
    Response {
        /// Request ID
        id: u64,
        /// Result payload
        result: Value,
    },
    /// Error reply to a request
    Error {
        /// Request ID (`None` if the server could not read it)
        id: Option<u64>,
        /// Error details
        error: ErrorObject,
    },
    /// Server-initiated notification (e.g. `onEvent`)
    Notification {
        /// Method name
        method: String,
        /// Parameters
        params: Value,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request
    pub fn new(method: impl Into<String>, params: Value, id: Option<u64>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.map(Value::from),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }
}

impl Incoming {
    /// Classify a raw text frame from the media server
    pub fn parse(text: &str) -> crate::Result<Self> {
        let raw: RawMessage = serde_json::from_str(text).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to parse JSON-RPC message: {}", e))
        })?;

        let numeric_id = raw.id.as_ref().and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });

        if let Some(error) = raw.error {
            return Ok(Incoming::Error {
                id: numeric_id,
                error,
            });
        }

        if let Some(method) = raw.method {
            return Ok(Incoming::Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
            });
        }

        match numeric_id {
            Some(id) => Ok(Incoming::Response {
                id,
                result: raw.result.unwrap_or(Value::Null),
            }),
            None => Err(crate::Error::SerializationError(
                "JSON-RPC message has neither method nor numeric id".to_string(),
            )),
        }
    }
}
