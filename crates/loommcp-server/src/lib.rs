//! # loommcp-server
//!
//! MCP server for the loommcp SDK: register resources, templates, and
//! tools; attach one or more transports; serve JSON-RPC over a
//! work-stealing worker pool with rate limiting and a resource cache on
//! the hot path.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use loommcp_core::{ContentItem, Tool, ToolParam};
//! use loommcp_server::{McpServer, ToolOutput};
//! use loommcp_transport::{TcpServerConfig, TcpServerTransport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = McpServer::builder()
//!         .name("example")
//!         .tool(
//!             Tool::new("echo").with_param(ToolParam::required("text", "string")),
//!             Arc::new(|_name, args| {
//!                 let value: serde_json::Value = serde_json::from_str(args).unwrap_or_default();
//!                 let text = value.get("text").and_then(|v| v.as_str()).unwrap_or("");
//!                 Ok(ToolOutput::ok(vec![ContentItem::text(text)]))
//!             }),
//!         )
//!         .build()?;
//!
//!     server.attach(Arc::new(TcpServerTransport::new(TcpServerConfig::default())));
//!     server.start()?;
//!     // ... wait for a shutdown signal ...
//!     server.stop();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod registry;
pub mod server;

pub use config::ServerConfig;
pub use dispatch::{Dispatcher, PROTOCOL_VERSION};
pub use registry::{
    NotificationHandler, Registry, ResourceHandler, ToolHandler, ToolOutput,
};
pub use server::{McpServer, ServerBuilder, ServerError};
