//! The dispatch core.
//!
//! The transport callback does the minimum on the transport thread: bound
//! the size, copy the payload, and enqueue a task. A pool worker then runs
//! the full pipeline (API-key check, rate limiting, parse, route to the
//! method handler) and sends the response back through the originating
//! connection's context.

use std::sync::Arc;

use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tracing::{debug, trace, warn};

use loommcp_core::{
    ContentItem, ErrorKind, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, McpError, McpResult,
    jsonrpc,
};
use loommcp_runtime::cache::ResourceCache;
use loommcp_runtime::executor::ThreadPool;
use loommcp_runtime::ratelimit::{RateLimiter, RequestKeys};
use loommcp_transport::{ConnectionContext, TransportCallbacks};

use crate::config::ServerConfig;
use crate::registry::Registry;

/// MCP protocol revision implemented by this server.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Routes parsed messages to method handlers.
pub struct Dispatcher {
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    cache: Arc<ResourceCache>,
    limiter: Arc<RateLimiter>,
    pool: Arc<ThreadPool>,
}

impl Dispatcher {
    /// Assemble a dispatcher over shared server state.
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<Registry>,
        cache: Arc<ResourceCache>,
        limiter: Arc<RateLimiter>,
        pool: Arc<ThreadPool>,
    ) -> Self {
        Self {
            config,
            registry,
            cache,
            limiter,
            pool,
        }
    }

    /// The callback pair to hand to every transport.
    pub fn callbacks(self: &Arc<Self>) -> TransportCallbacks {
        let dispatcher = Arc::clone(self);
        TransportCallbacks::new(Arc::new(move |payload: &[u8], ctx: &ConnectionContext| {
            dispatcher.on_message(payload, ctx);
        }))
    }

    /// Transport-thread entry point: bound, copy, enqueue.
    fn on_message(self: &Arc<Self>, payload: &[u8], ctx: &ConnectionContext) {
        if payload.len() > self.config.max_message_size {
            // The frame cannot be trusted enough to answer it.
            warn!(
                size = payload.len(),
                max = self.config.max_message_size,
                "dropping oversized message"
            );
            return;
        }
        let bytes = payload.to_vec();
        let ctx = ctx.clone();
        let dispatcher = Arc::clone(self);
        if let Err(e) = self.pool.submit(move || dispatcher.process(&bytes, &ctx)) {
            warn!(error = %e, "task submission failed");
        }
    }

    /// Worker-thread pipeline for one message.
    fn process(&self, bytes: &[u8], ctx: &ConnectionContext) {
        if !self.api_key_ok(bytes) {
            debug!(peer = ?ctx.peer_addr(), "api key rejected");
            self.send_error(ctx, jsonrpc::peek_id(bytes), &McpError::auth_failed());
            return;
        }

        if !self.rate_limit_ok(bytes, ctx) {
            self.send_error(ctx, jsonrpc::peek_id(bytes), &McpError::rate_limited());
            return;
        }

        match JsonRpcMessage::from_slice(bytes) {
            Ok(JsonRpcMessage::Request(request)) => {
                let response = match self.handle_request(&request, ctx) {
                    Ok(result) => JsonRpcResponse::success(request.id, result),
                    Err(e) => {
                        debug!(method = %request.method, error = %e, "request failed");
                        JsonRpcResponse::from_error(request.id, &e)
                    }
                };
                self.send_response(ctx, &response);
            }
            Ok(JsonRpcMessage::Notification(notification)) => {
                match self.registry.notification_handler() {
                    Some(handler) => {
                        handler(&notification.method, notification.params.as_ref());
                    }
                    None => trace!(method = %notification.method, "notification ignored"),
                }
            }
            // Servers do not issue requests, so responses have no home.
            Ok(JsonRpcMessage::Response(response)) => {
                trace!(id = response.id, "ignoring unexpected response");
            }
            Err(e) => {
                self.send_error(ctx, jsonrpc::peek_id(bytes), &e);
            }
        }
    }

    fn api_key_ok(&self, payload: &[u8]) -> bool {
        let Some(expected) = &self.config.api_key else {
            return true;
        };
        let presented = jsonrpc::peek_str_field(payload, "apiKey").unwrap_or_default();
        presented.as_bytes().ct_eq(expected.as_bytes()).into()
    }

    fn rate_limit_ok(&self, payload: &[u8], ctx: &ConnectionContext) -> bool {
        let ip = ctx.client_ip();
        let api_key = jsonrpc::peek_str_field(payload, "apiKey");
        let user = jsonrpc::peek_str_field(payload, "user");
        let keys = RequestKeys {
            ip: ip.as_deref(),
            api_key: api_key.as_deref(),
            user: user.as_deref(),
            custom: None,
        };
        self.limiter.check(keys)
    }

    fn handle_request(&self, request: &JsonRpcRequest, ctx: &ConnectionContext) -> McpResult<Value> {
        match request.method.as_str() {
            "initialize" => Ok(self.initialize_result(ctx)),
            "ping" => Ok(json!({})),
            "list_resources" | "resources/list" => Ok(json!({
                "resources": self.registry.resources(),
            })),
            "list_resource_templates" | "resources/templates/list" => Ok(json!({
                "resourceTemplates": self.registry.templates(),
            })),
            "read_resource" | "resources/read" => self.read_resource(request.params.as_ref()),
            "list_tools" | "tools/list" => Ok(json!({
                "tools": self.registry.tools().iter().map(loommcp_core::Tool::to_wire).collect::<Vec<_>>(),
            })),
            "call_tool" | "tools/call" => self.call_tool(request.params.as_ref()),
            other => Err(McpError::method_not_found(other)),
        }
    }

    fn initialize_result(&self, ctx: &ConnectionContext) -> Value {
        let mut result = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": self.config.name,
                "version": self.config.version,
            },
            "capabilities": {
                "resources": {"listChanged": false},
                "tools": {"listChanged": false},
            },
        });
        if let Some(session_id) = ctx.session_id() {
            result["sessionId"] = Value::String(session_id.to_owned());
        }
        result
    }

    fn read_resource(&self, params: Option<&Value>) -> McpResult<Value> {
        let uri = params
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::invalid_params("read_resource requires a string 'uri'"))?;

        let items = match self.cache.get(uri) {
            Some(cached) => cached,
            None => {
                let handler = self
                    .registry
                    .resource_handler()
                    .ok_or_else(|| McpError::resource_not_found(uri))?;
                let items = handler(uri)?;
                self.cache.put(uri, &items, None);
                items
            }
        };

        let contents: Vec<Value> = items
            .iter()
            .map(|item| item.to_resource_contents(uri))
            .collect();
        Ok(json!({ "contents": contents }))
    }

    fn call_tool(&self, params: Option<&Value>) -> McpResult<Value> {
        let name = params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::invalid_params("call_tool requires a string 'name'"))?;
        let arguments = params
            .and_then(|p| p.get("arguments"))
            .map_or_else(|| "{}".to_owned(), Value::to_string);

        let handler = self
            .registry
            .tool_handler(name)
            .ok_or_else(|| McpError::new(ErrorKind::ToolFailed, format!("Unknown tool: {name}")))?;
        let output = handler(name, &arguments)?;

        let content: Vec<Value> = output.items.iter().map(ContentItem::to_wire).collect();
        Ok(json!({ "content": content, "isError": output.is_error }))
    }

    fn send_response(&self, ctx: &ConnectionContext, response: &JsonRpcResponse) {
        match serde_json::to_vec(response) {
            Ok(bytes) => {
                if let Err(e) = ctx.send(&bytes) {
                    warn!(error = %e, "failed to send response");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize response"),
        }
    }

    fn send_error(&self, ctx: &ConnectionContext, id: Option<u64>, error: &McpError) {
        let response = JsonRpcResponse::from_error(id.unwrap_or(0), error);
        self.send_response(ctx, &response);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}
