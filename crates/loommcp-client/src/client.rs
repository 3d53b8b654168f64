//! Synchronous MCP client.
//!
//! One connection, many concurrent in-flight requests: callers block in
//! [`Client::request`] while a single receive thread decodes frames and
//! fans responses back out through the pending table. On any transport
//! failure every waiting caller gets `ConnectionClosed`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use loommcp_core::{
    ContentItem, DEFAULT_MAX_MESSAGE_SIZE, ErrorKind, JsonRpcMessage, JsonRpcRequest, McpError,
    McpResult, ResponsePayload, codes,
};
use loommcp_transport::{ClientTransport, TcpClientTransport, WsClientTransport};

use crate::pending::{Outcome, PendingTable, WaitResult};

/// How often the receive thread re-checks its shutdown flag.
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default per-request timeout.
    pub request_timeout: Duration,
    /// Frame payload limit.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// A parsed `call_tool` result.
#[derive(Debug, Clone, PartialEq)]
pub struct CallToolResult {
    /// Result content items.
    pub content: Vec<ContentItem>,
    /// Whether the tool reported a domain-level failure.
    pub is_error: bool,
}

/// Invoked once when the connection drops.
pub type DisconnectHandler = Arc<dyn Fn(&McpError) + Send + Sync>;

/// Synchronous MCP client over a framed transport.
pub struct Client {
    transport: Arc<dyn ClientTransport>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    config: ClientConfig,
    on_disconnect: Arc<Mutex<Option<DisconnectHandler>>>,
}

impl Client {
    /// Connect over length-prefixed TCP.
    ///
    /// # Errors
    ///
    /// Connection failures.
    pub fn connect_tcp(addr: SocketAddr, config: ClientConfig) -> McpResult<Self> {
        let transport = TcpClientTransport::connect(addr, config.max_message_size)?;
        Ok(Self::over(Arc::new(transport), config))
    }

    /// Connect over WebSocket.
    ///
    /// # Errors
    ///
    /// Connection and handshake failures.
    pub fn connect_ws(addr: SocketAddr, path: &str, config: ClientConfig) -> McpResult<Self> {
        let transport = WsClientTransport::connect(addr, path, config.max_message_size)?;
        Ok(Self::over(Arc::new(transport), config))
    }

    /// Wrap an already-connected transport and spawn the receive thread.
    pub fn over(transport: Arc<dyn ClientTransport>, config: ClientConfig) -> Self {
        let pending = Arc::new(PendingTable::new());
        let connected = Arc::new(AtomicBool::new(true));
        let on_disconnect: Arc<Mutex<Option<DisconnectHandler>>> = Arc::new(Mutex::new(None));

        let receiver = spawn_receive_thread(
            Arc::clone(&transport),
            Arc::clone(&pending),
            Arc::clone(&connected),
            Arc::clone(&on_disconnect),
        );

        Self {
            transport,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            receiver: Mutex::new(receiver),
            config,
            on_disconnect,
        }
    }

    /// Install a handler invoked once when the connection drops.
    pub fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *self.on_disconnect.lock() = Some(handler);
    }

    /// Whether the receive thread still considers the connection healthy.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// In-flight request count.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Issue a request and block for its response.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` when the transport is down, `Timeout` when the
    /// deadline elapses, or the server's error mapped onto [`McpError`].
    pub fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.request_with_timeout(method, params, self.config.request_timeout)
    }

    /// [`Client::request`] with an explicit timeout.
    ///
    /// # Errors
    ///
    /// As [`Client::request`].
    pub fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        if !self.is_connected() {
            return Err(McpError::connection_closed("client is disconnected"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let bytes = serde_json::to_vec(&request).map_err(|e| McpError::internal(e.to_string()))?;

        if !self.pending.register(id) {
            return Err(McpError::internal(format!("request id {id} already in flight")));
        }
        if let Err(e) = self.transport.send(&bytes) {
            self.pending.remove(id);
            return Err(e.into());
        }
        trace!(id, method, "request sent");

        let result = match self.pending.wait(id, timeout) {
            WaitResult::Completed(value) => Ok(value),
            WaitResult::Error { code, message } => {
                Err(McpError::new(ErrorKind::from_code(code), message))
            }
            WaitResult::TimedOut => Err(McpError::timeout(format!(
                "no response to '{method}' within {timeout:?}"
            ))),
            WaitResult::Unknown => Err(McpError::connection_closed("request table lost the id")),
        };
        self.pending.remove(id);
        result
    }

    /// Send a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::connection_closed("client is disconnected"));
        }
        let notification = loommcp_core::JsonRpcNotification::new(method, params);
        let bytes =
            serde_json::to_vec(&notification).map_err(|e| McpError::internal(e.to_string()))?;
        self.transport.send(&bytes).map_err(Into::into)
    }

    /// `initialize` handshake; returns the server's capabilities object.
    ///
    /// # Errors
    ///
    /// As [`Client::request`].
    pub fn initialize(&self) -> McpResult<Value> {
        self.request("initialize", Some(serde_json::json!({})))
    }

    /// `ping` round trip.
    ///
    /// # Errors
    ///
    /// As [`Client::request`].
    pub fn ping(&self) -> McpResult<()> {
        self.request("ping", None).map(|_| ())
    }

    /// `list_resources`.
    ///
    /// # Errors
    ///
    /// As [`Client::request`].
    pub fn list_resources(&self) -> McpResult<Value> {
        self.request("list_resources", None)
    }

    /// `list_resource_templates`.
    ///
    /// # Errors
    ///
    /// As [`Client::request`].
    pub fn list_resource_templates(&self) -> McpResult<Value> {
        self.request("list_resource_templates", None)
    }

    /// `read_resource` for one URI; returns the `contents` array.
    ///
    /// # Errors
    ///
    /// As [`Client::request`].
    pub fn read_resource(&self, uri: &str) -> McpResult<Value> {
        self.request("read_resource", Some(serde_json::json!({ "uri": uri })))
            .map(|mut result| result["contents"].take())
    }

    /// `list_tools`; returns the raw `tools` array.
    ///
    /// # Errors
    ///
    /// As [`Client::request`].
    pub fn list_tools(&self) -> McpResult<Value> {
        self.request("list_tools", None).map(|mut result| result["tools"].take())
    }

    /// `call_tool` with JSON arguments.
    ///
    /// # Errors
    ///
    /// As [`Client::request`].
    pub fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        let result = self.request(
            "call_tool",
            Some(serde_json::json!({ "name": name, "arguments": arguments })),
        )?;
        let content = result["content"]
            .as_array()
            .map(|items| items.iter().filter_map(ContentItem::from_wire).collect())
            .unwrap_or_default();
        let is_error = result["isError"].as_bool().unwrap_or(false);
        Ok(CallToolResult { content, is_error })
    }

    /// Close the connection, fail pending requests, and join the receive
    /// thread.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!("disconnecting client");
        }
        self.transport.shutdown();
        if let Some(handle) = self.receiver.lock().take()
            && handle.join().is_err()
        {
            warn!("receive thread panicked");
        }
        self.pending.fail_all(codes::CONNECTION_CLOSED, "connection closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn spawn_receive_thread(
    transport: Arc<dyn ClientTransport>,
    pending: Arc<PendingTable>,
    connected: Arc<AtomicBool>,
    on_disconnect: Arc<Mutex<Option<DisconnectHandler>>>,
) -> Option<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("loommcp-client-recv".into())
        .spawn(move || {
            loop {
                if !connected.load(Ordering::Acquire) {
                    break;
                }
                match transport.receive(RECEIVE_POLL) {
                    Ok(Some(bytes)) => route_message(&bytes, &pending),
                    Ok(None) => {}
                    Err(e) => {
                        let was_connected = connected.swap(false, Ordering::AcqRel);
                        pending.fail_all(codes::CONNECTION_CLOSED, "connection closed");
                        if was_connected {
                            debug!(error = %e, "receive loop ended");
                            let error: McpError = e.into();
                            if let Some(handler) = on_disconnect.lock().as_ref() {
                                handler(&error);
                            }
                        }
                        break;
                    }
                }
            }
        })
        .map_err(|e| warn!(error = %e, "failed to spawn receive thread"))
        .ok()
}

fn route_message(bytes: &[u8], pending: &PendingTable) {
    match JsonRpcMessage::from_slice(bytes) {
        Ok(JsonRpcMessage::Response(response)) => {
            let outcome = match response.payload {
                ResponsePayload::Success { result } => Outcome::Success(result),
                ResponsePayload::Error { error } => Outcome::Failure {
                    code: error.code,
                    message: error.message,
                },
            };
            pending.deliver(response.id, outcome);
        }
        Ok(JsonRpcMessage::Notification(notification)) => {
            trace!(method = %notification.method, "server notification ignored");
        }
        Ok(JsonRpcMessage::Request(request)) => {
            trace!(method = %request.method, "server-initiated request ignored");
        }
        Err(e) => debug!(error = %e, "undecodable frame from server"),
    }
}
