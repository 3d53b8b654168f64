//! # loommcp-client
//!
//! Synchronous MCP client for the loommcp SDK. A single receive thread
//! demultiplexes responses onto concurrent blocked callers via a
//! pending-request table keyed by JSON-RPC id.
//!
//! ## Example
//!
//! ```no_run
//! use loommcp_client::{Client, ClientConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect_tcp("127.0.0.1:8080".parse()?, ClientConfig::default())?;
//!     client.initialize()?;
//!     let result = client.call_tool("echo", serde_json::json!({"text": "hi"}))?;
//!     println!("{:?}", result.content);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod pending;

pub use client::{CallToolResult, Client, ClientConfig, DisconnectHandler};
pub use pending::{Outcome, PendingTable, WaitResult};
