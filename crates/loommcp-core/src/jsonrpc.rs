//! JSON-RPC 2.0 message types.
//!
//! The MCP dialect restricts ids to unsigned integers: ids are
//! client-assigned, monotonically increasing, and `0` denotes "unset"
//! (notifications never carry an id on the wire). Incoming payloads are
//! classified into request / response / notification by shape rather than
//! by a serde untagged union so that malformed traffic yields precise
//! `InvalidRequest` errors and a best-effort id for the error reply.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{McpError, McpResult};

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Zero-sized marker that serializes as the literal string `"2.0"` and
/// rejects anything else on input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "Invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// A request expecting a correlated response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Version marker.
    pub jsonrpc: JsonRpcVersion,
    /// Request id; never 0 on the wire.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            method: method.into(),
            params,
        }
    }
}

/// A fire-and-forget message; no response is ever produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Version marker.
    pub jsonrpc: JsonRpcVersion,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }
}

/// The error object carried by a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Error code; see [`crate::error::codes`].
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Response body: exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Successful response.
    Success {
        /// The result value.
        result: Value,
    },
    /// Failed response.
    Error {
        /// The error object.
        error: JsonRpcError,
    },
}

/// A response correlated to a request by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Version marker.
    pub jsonrpc: JsonRpcVersion,
    /// Id of the request this answers.
    pub id: u64,
    /// Result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            payload: ResponsePayload::Success { result },
        }
    }

    /// Build an error response from a raw code and message.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            payload: ResponsePayload::Error {
                error: JsonRpcError {
                    code,
                    message: message.into(),
                    data: None,
                },
            },
        }
    }

    /// Build an error response from an [`McpError`].
    pub fn from_error(id: u64, err: &McpError) -> Self {
        Self::error(id, err.code(), err.message.clone())
    }

    /// The result value, if this is a success.
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Success { result } => Some(result),
            ResponsePayload::Error { .. } => None,
        }
    }

    /// The error object, if this is a failure.
    pub fn error_object(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            ResponsePayload::Success { .. } => None,
            ResponsePayload::Error { error } => Some(error),
        }
    }
}

/// Any JSON-RPC message, classified by shape.
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    /// Request with id.
    Request(JsonRpcRequest),
    /// Response with id and result/error.
    Response(JsonRpcResponse),
    /// Notification without id.
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Parse and classify one message.
    ///
    /// # Errors
    ///
    /// `ParseError` for invalid JSON, `InvalidRequest` for JSON that is not
    /// a JSON-RPC 2.0 object.
    pub fn from_slice(bytes: &[u8]) -> McpResult<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| McpError::parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Classify an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when the value is not a JSON-RPC 2.0 object.
    pub fn from_value(value: Value) -> McpResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| McpError::invalid_request("message is not a JSON object"))?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            _ => return Err(McpError::invalid_request("missing or invalid jsonrpc version")),
        }

        let id = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| {
                McpError::invalid_request("id must be an unsigned integer")
            })?),
        };

        if let Some(method) = obj.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| McpError::invalid_request("method must be a string"))?
                .to_owned();
            let params = obj.get("params").cloned();
            return Ok(match id {
                Some(id) => Self::Request(JsonRpcRequest {
                    jsonrpc: JsonRpcVersion,
                    id,
                    method,
                    params,
                }),
                None => Self::Notification(JsonRpcNotification {
                    jsonrpc: JsonRpcVersion,
                    method,
                    params,
                }),
            });
        }

        if obj.contains_key("result") || obj.contains_key("error") {
            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| McpError::invalid_request(e.to_string()))?;
            return Ok(Self::Response(response));
        }

        Err(McpError::invalid_request("message is neither request, response, nor notification"))
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// The id for requests and responses.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Request(r) => Some(r.id),
            Self::Response(r) => Some(r.id),
            Self::Notification(_) => None,
        }
    }

    /// Serialize back to a compact JSON byte vector.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures as `Internal`.
    pub fn to_bytes(&self) -> McpResult<Vec<u8>> {
        let result = match self {
            Self::Request(m) => serde_json::to_vec(m),
            Self::Response(m) => serde_json::to_vec(m),
            Self::Notification(m) => serde_json::to_vec(m),
        };
        result.map_err(|e| McpError::internal(e.to_string()))
    }
}

/// Best-effort extraction of a request id from raw bytes.
///
/// Used to attach an id to error replies for messages that fail
/// authentication or parsing after the id has already been written.
pub fn peek_id(bytes: &[u8]) -> Option<u64> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value.get("id")?.as_u64()
}

/// Best-effort extraction of a top-level string field from raw bytes.
///
/// The API-key check peeks at the payload before full parse; this keeps
/// that lookup in one place.
pub fn peek_str_field(bytes: &[u8], field: &str) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value.get(field)?.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_request() {
        let msg =
            JsonRpcMessage::from_slice(br#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).unwrap();
        match msg {
            JsonRpcMessage::Request(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.method, "ping");
                assert!(r.params.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let msg = JsonRpcMessage::from_slice(
            br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .unwrap();
        assert!(matches!(msg, JsonRpcMessage::Notification(_)));
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn null_id_is_notification() {
        let msg =
            JsonRpcMessage::from_slice(br#"{"jsonrpc":"2.0","id":null,"method":"x"}"#).unwrap();
        assert!(matches!(msg, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn classify_response_success_and_error() {
        let ok =
            JsonRpcMessage::from_slice(br#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#)
                .unwrap();
        match ok {
            JsonRpcMessage::Response(r) => assert!(r.result().is_some()),
            other => panic!("expected response, got {other:?}"),
        }

        let err = JsonRpcMessage::from_slice(
            br#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        match err {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.error_object().unwrap().code, -32601);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn reject_wrong_version() {
        let err = JsonRpcMessage::from_slice(br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#)
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::InvalidRequest);
    }

    #[test]
    fn reject_invalid_json() {
        let err = JsonRpcMessage::from_slice(b"{not json").unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::ParseError);
    }

    #[test]
    fn reject_string_id() {
        let err = JsonRpcMessage::from_slice(br#"{"jsonrpc":"2.0","id":"abc","method":"x"}"#)
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::InvalidRequest);
    }

    #[test]
    fn round_trip_request() {
        let req = JsonRpcRequest::new(3, "call_tool", Some(json!({"name":"echo"})));
        let bytes = serde_json::to_vec(&req).unwrap();
        let back = JsonRpcMessage::from_slice(&bytes).unwrap();
        assert_eq!(back.id(), Some(3));
        assert_eq!(back.method(), Some("call_tool"));
    }

    #[test]
    fn response_serialization_shape() {
        let ok = JsonRpcResponse::success(1, json!({"tools": []}));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains(r#""result""#));
        assert!(!text.contains(r#""error""#));

        let err = JsonRpcResponse::error(1, -32000, "Rate limit exceeded");
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains(r#""error""#));
        assert!(!text.contains(r#""result""#));
    }

    #[test]
    fn peek_helpers() {
        let bytes = br#"{"jsonrpc":"2.0","id":42,"method":"x","apiKey":"sekrit"}"#;
        assert_eq!(peek_id(bytes), Some(42));
        assert_eq!(peek_str_field(bytes, "apiKey").as_deref(), Some("sekrit"));
        assert_eq!(peek_id(b"garbage"), None);
    }
}
