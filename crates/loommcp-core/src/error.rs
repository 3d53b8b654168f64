//! Unified error taxonomy.
//!
//! Every layer of the SDK maps its failures into [`McpError`], and the
//! dispatch core translates that into the JSON-RPC error object sent on the
//! wire. Standard JSON-RPC codes cover the protocol-level kinds; the
//! application-scoped kinds use documented constants below `-32000`.

use thiserror::Error;

/// A specialized `Result` type for MCP operations.
pub type McpResult<T> = std::result::Result<T, McpError>;

/// JSON-RPC error codes emitted by the dispatch core.
pub mod codes {
    /// Invalid JSON was received (-32700).
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid request object (-32600).
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist (-32601).
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters (-32602).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error (-32603).
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Request rejected by the rate limiter.
    pub const RATE_LIMITED: i32 = -32000;
    /// No registered resource matches the requested URI.
    pub const RESOURCE_NOT_FOUND: i32 = -32001;
    /// A tool handler reported failure.
    pub const TOOL_FAILED: i32 = -32002;
    /// API key missing or mismatched.
    pub const AUTH_FAILED: i32 = -32003;
    /// Request origin not in the allowed set.
    pub const ORIGIN_DENIED: i32 = -32004;
    /// Session id unknown, expired, or its event ring no longer covers the
    /// requested replay point.
    pub const SESSION_GONE: i32 = -32005;
    /// Message exceeded the configured size limit.
    pub const PAYLOAD_TOO_LARGE: i32 = -32006;
    /// The operation did not complete in time.
    pub const TIMEOUT: i32 = -32007;
    /// The underlying connection closed while the request was in flight.
    pub const CONNECTION_CLOSED: i32 = -32008;
    /// A transport-level failure outside any single request.
    pub const TRANSPORT_ERROR: i32 = -32009;
}

/// Classification of every failure the SDK can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Invalid JSON on the wire.
    ParseError,
    /// Structurally valid JSON that is not a valid JSON-RPC message.
    InvalidRequest,
    /// Unknown method name.
    MethodNotFound,
    /// Parameters missing or of the wrong shape.
    InvalidParams,
    /// Unexpected internal failure.
    Internal,
    /// Resource URI not registered and no handler produced content.
    ResourceNotFound,
    /// Tool handler returned an error.
    ToolFailed,
    /// Rejected by the rate limiter.
    RateLimited,
    /// API key check failed.
    AuthFailed,
    /// Socket-level failure.
    TransportError,
    /// Deadline elapsed.
    Timeout,
    /// Peer closed the connection.
    ConnectionClosed,
    /// Origin header rejected.
    OriginDenied,
    /// Session unknown or replay gap detected.
    SessionGone,
    /// Message larger than the configured maximum.
    PayloadTooLarge,
}

impl ErrorKind {
    /// The JSON-RPC error code for this kind.
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => codes::PARSE_ERROR,
            Self::InvalidRequest => codes::INVALID_REQUEST,
            Self::MethodNotFound => codes::METHOD_NOT_FOUND,
            Self::InvalidParams => codes::INVALID_PARAMS,
            Self::Internal => codes::INTERNAL_ERROR,
            Self::RateLimited => codes::RATE_LIMITED,
            Self::ResourceNotFound => codes::RESOURCE_NOT_FOUND,
            Self::ToolFailed => codes::TOOL_FAILED,
            Self::AuthFailed => codes::AUTH_FAILED,
            Self::OriginDenied => codes::ORIGIN_DENIED,
            Self::SessionGone => codes::SESSION_GONE,
            Self::PayloadTooLarge => codes::PAYLOAD_TOO_LARGE,
            Self::Timeout => codes::TIMEOUT,
            Self::ConnectionClosed => codes::CONNECTION_CLOSED,
            Self::TransportError => codes::TRANSPORT_ERROR,
        }
    }

    /// Reverse mapping from a wire code, for client-side classification.
    pub fn from_code(code: i32) -> Self {
        match code {
            codes::PARSE_ERROR => Self::ParseError,
            codes::INVALID_REQUEST => Self::InvalidRequest,
            codes::METHOD_NOT_FOUND => Self::MethodNotFound,
            codes::INVALID_PARAMS => Self::InvalidParams,
            codes::RATE_LIMITED => Self::RateLimited,
            codes::RESOURCE_NOT_FOUND => Self::ResourceNotFound,
            codes::TOOL_FAILED => Self::ToolFailed,
            codes::AUTH_FAILED => Self::AuthFailed,
            codes::ORIGIN_DENIED => Self::OriginDenied,
            codes::SESSION_GONE => Self::SessionGone,
            codes::PAYLOAD_TOO_LARGE => Self::PayloadTooLarge,
            codes::TIMEOUT => Self::Timeout,
            codes::CONNECTION_CLOSED => Self::ConnectionClosed,
            codes::TRANSPORT_ERROR => Self::TransportError,
            _ => Self::Internal,
        }
    }
}

/// An error with its protocol classification and a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct McpError {
    /// Classification used for code mapping.
    pub kind: ErrorKind,
    /// Human-readable description, safe to put on the wire.
    pub message: String,
}

impl McpError {
    /// Create an error with an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The JSON-RPC code for this error.
    pub fn code(&self) -> i32 {
        self.kind.code()
    }

    /// Invalid JSON on the wire.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, message)
    }

    /// Structurally invalid JSON-RPC.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// Unknown method.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorKind::MethodNotFound, format!("Method not found: {method}"))
    }

    /// Bad parameters.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    /// Unexpected internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Unregistered resource URI.
    pub fn resource_not_found(uri: &str) -> Self {
        Self::new(ErrorKind::ResourceNotFound, format!("Resource not found: {uri}"))
    }

    /// Tool handler failure.
    pub fn tool_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolFailed, message)
    }

    /// Rejected by the rate limiter.
    pub fn rate_limited() -> Self {
        Self::new(ErrorKind::RateLimited, "Rate limit exceeded")
    }

    /// API key rejected.
    pub fn auth_failed() -> Self {
        Self::new(ErrorKind::AuthFailed, "Authentication failed")
    }

    /// Socket-level failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportError, message)
    }

    /// Deadline elapsed.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Connection closed under the request.
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionClosed, message)
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(err.to_string())
    }
}
