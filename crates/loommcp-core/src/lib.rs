//! # loommcp-core
//!
//! Foundation layer for the loommcp SDK: JSON-RPC 2.0 message types, MCP
//! resource/tool definitions, typed content items, the shared error
//! taxonomy, and the memory primitives (bump arena, buffer pool) used on
//! the server hot path.
//!
//! Everything here is transport-agnostic and thread-model-agnostic; the
//! runtime, transport, server, and client crates build on these types.

pub mod arena;
pub mod content;
pub mod definitions;
pub mod error;
pub mod jsonrpc;
pub mod pool;

pub use arena::Arena;
pub use content::{ContentBody, ContentItem};
pub use definitions::{Resource, ResourceTemplate, Tool, ToolParam};
pub use error::{ErrorKind, McpError, McpResult, codes};
pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ResponsePayload,
};
pub use pool::{BufferPool, PooledBuffer};

/// Maximum accepted message size in bytes (1 MiB) unless configured otherwise.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
