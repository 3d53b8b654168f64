//! # loommcp-transport
//!
//! Wire transports for the loommcp SDK. All four share one
//! message/callback contract ([`traits`]) and differ only in framing and
//! lifecycle:
//!
//! - [`tcp`]: 4-byte big-endian length prefix, then JSON.
//! - [`stdio`]: newline-delimited JSON on stdin/stdout.
//! - [`ws`]: one JSON-RPC message per WebSocket text frame.
//! - [`http`]: Streamable HTTP, a single endpoint with POST/GET/DELETE/OPTIONS and
//!   SSE with `Last-Event-Id` replay backed by the [`session`] store.
//!
//! Everything is synchronous: accept loops, per-connection handler
//! threads, and short-timeout blocking reads that keep shutdown prompt.

pub mod error;
pub mod frame;
pub mod http;
mod listener;
pub mod session;
pub mod stdio;
pub mod tcp;
pub mod traits;
pub mod ws;

pub use error::{TransportError, TransportResult};
pub use http::{HttpServerConfig, HttpServerTransport};
pub use session::{Replay, SessionConfig, SessionStore, StoredEvent};
pub use stdio::{StdioConfig, StdioServerTransport};
pub use tcp::{TcpClientTransport, TcpServerConfig, TcpServerTransport};
pub use traits::{
    ClientTransport, ConnectionContext, ErrorCallback, MessageCallback, ServerTransport,
    TransportCallbacks, TransportKind,
};
pub use ws::{WsClientTransport, WsServerConfig, WsServerTransport};
