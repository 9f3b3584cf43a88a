//! JSON-RPC 2.0 envelope layer
//!
//! Wire types for requests, responses, and notifications, plus the
//! classification of inbound envelopes. A message with `method` and `id` is a
//! request, with `method` alone a notification, with `id` alone a response;
//! `result` and `error` are mutually exclusive on responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ============================================================================
// Request Ids
// ============================================================================

/// A JSON-RPC request id: a number or a string.
///
/// Ids assigned by this client go on the wire as decimal strings; ids minted
/// by the server are accepted in either shape and echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl RequestId {
    /// Wire form for a locally assigned sequence number.
    pub fn from_sequence(seq: i64) -> Self {
        Self::Text(seq.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

// ============================================================================
// Envelope Types
// ============================================================================

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier
    pub id: RequestId,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response message
///
/// Exactly one of `result`/`error` is present; `skip_serializing_if` keeps
/// the absent field off the wire, which covers both response shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier (matches the request)
    pub id: RequestId,

    /// Result (present if successful; may be JSON null)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: JsonRpcErrorObject) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: JsonRpcErrorCode::MethodNotFound as i32,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn handler_failure(message: String, data: Option<Value>) -> Self {
        Self {
            code: JsonRpcErrorCode::HandlerFailure as i32,
            message,
            data,
        }
    }
}

// ============================================================================
// Error Codes
// ============================================================================

/// JSON-RPC error codes produced or interpreted by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JsonRpcErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    /// An inbound handler failed; the message and diagnostic data ride along.
    HandlerFailure = 500,
}

// ============================================================================
// Outbound Queue Items
// ============================================================================

/// One entry on the outbound queue, tagged by envelope kind.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl OutboundMessage {
    /// Method name for logging; responses have none.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Compact JSON for the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Request(r) => serde_json::to_string(r),
            Self::Notification(n) => serde_json::to_string(n),
            Self::Response(r) => serde_json::to_string(r),
        }
    }
}

// ============================================================================
// Inbound Classification
// ============================================================================

/// Classified inbound JSON-RPC envelope
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Server-initiated request (has method + non-null id)
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// Notification (has method, id null or missing)
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Response to one of our requests (no method, has non-null id)
    Response {
        id: RequestId,
        result: Option<Value>,
        error: Option<JsonRpcErrorObject>,
    },
    /// Envelope that couldn't be classified
    Invalid(String),
}

impl InboundMessage {
    /// Classify one decoded frame according to JSON-RPC 2.0.
    ///
    /// The discriminant is the co-presence of `id` and `method`, not the
    /// presence of `params`.
    pub fn classify(text: &str) -> Self {
        let parsed = match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(e) => return Self::Invalid(format!("JSON parse error: {e}")),
        };

        let method = parsed
            .get("method")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string());
        let id = parsed
            .get("id")
            .filter(|id| !id.is_null())
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
        let params = parsed.get("params").cloned();

        match (method, id) {
            (Some(method), Some(id)) => Self::Request { id, method, params },
            (Some(method), None) => Self::Notification { method, params },
            (None, Some(id)) => {
                let result = parsed.get("result").cloned();
                let error = parsed
                    .get("error")
                    .and_then(|e| serde_json::from_value::<JsonRpcErrorObject>(e.clone()).ok());
                Self::Response { id, result, error }
            }
            (None, None) => Self::Invalid("missing required fields or invalid structure".into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_absent_params() {
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: RequestId::from_sequence(1),
            method: "shutdown".to_string(),
            params: None,
        };
        let text = serde_json::to_string(&req).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":"1","method":"shutdown"}"#);
    }

    #[test]
    fn response_shapes_are_exclusive() {
        let ok = JsonRpcResponse::success(RequestId::Number(7), json!({"x": 1}));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains("\"result\""));
        assert!(!text.contains("\"error\""));

        let err = JsonRpcResponse::failure(
            RequestId::Number(7),
            JsonRpcErrorObject::method_not_found("nope"),
        );
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("\"error\""));
        assert!(!text.contains("\"result\""));
    }

    #[test]
    fn classify_request_notification_response() {
        let msg = InboundMessage::classify(r#"{"jsonrpc":"2.0","id":3,"method":"m"}"#);
        assert!(matches!(msg, InboundMessage::Request { .. }));

        let msg = InboundMessage::classify(r#"{"jsonrpc":"2.0","method":"m","params":{}}"#);
        assert!(matches!(msg, InboundMessage::Notification { .. }));

        let msg = InboundMessage::classify(r#"{"jsonrpc":"2.0","id":"3","result":null}"#);
        match msg {
            InboundMessage::Response { id, result, error } => {
                assert_eq!(id, RequestId::Text("3".to_string()));
                assert_eq!(result, Some(Value::Null));
                assert!(error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_null_id_is_notification() {
        let msg = InboundMessage::classify(r#"{"jsonrpc":"2.0","id":null,"method":"m"}"#);
        assert!(matches!(msg, InboundMessage::Notification { .. }));
    }

    #[test]
    fn classify_rejects_garbage() {
        assert!(matches!(
            InboundMessage::classify("not json"),
            InboundMessage::Invalid(_)
        ));
        assert!(matches!(
            InboundMessage::classify(r#"{"jsonrpc":"2.0"}"#),
            InboundMessage::Invalid(_)
        ));
    }

    #[test]
    fn request_id_round_trips_both_shapes() {
        let num: RequestId = serde_json::from_str("42").unwrap();
        assert_eq!(num, RequestId::Number(42));

        let text: RequestId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(text, RequestId::Text("42".to_string()));
        assert_eq!(serde_json::to_string(&text).unwrap(), "\"42\"");
    }
}
