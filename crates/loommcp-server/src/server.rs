//! Server lifecycle and builder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use loommcp_core::{Resource, ResourceTemplate, Tool};
use loommcp_runtime::cache::ResourceCache;
use loommcp_runtime::executor::{PoolError, ShutdownMode, ThreadPool};
use loommcp_runtime::ratelimit::RateLimiter;
use loommcp_transport::{ServerTransport, TransportError};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::registry::{NotificationHandler, Registry, ResourceHandler, ToolHandler};

/// Errors surfaced while building or running a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The worker pool could not be created.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// A transport failed to start.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

/// An MCP server: registries, dispatch pool, and attached transports.
///
/// Lifecycle: build → attach transports → [`McpServer::start`] → serve →
/// [`McpServer::stop`] (drains in-flight work up to the graceful timeout).
pub struct McpServer {
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    cache: Arc<ResourceCache>,
    limiter: Arc<RateLimiter>,
    pool: Arc<ThreadPool>,
    dispatcher: Arc<Dispatcher>,
    transports: Mutex<Vec<Arc<dyn ServerTransport>>>,
    running: AtomicBool,
}

impl McpServer {
    /// Start building a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Attach a transport; it starts when the server starts.
    pub fn attach(&self, transport: Arc<dyn ServerTransport>) {
        self.transports.lock().push(transport);
    }

    /// Start every attached transport.
    ///
    /// # Errors
    ///
    /// The first transport failure aborts the start; transports already
    /// started are stopped again.
    pub fn start(&self) -> Result<(), ServerError> {
        let transports = self.transports.lock();
        let mut started = 0usize;
        for transport in transports.iter() {
            if let Err(e) = transport.start(self.dispatcher.callbacks()) {
                warn!(kind = %transport.kind(), error = %e, "transport failed to start");
                for stop_me in transports.iter().take(started) {
                    stop_me.stop();
                }
                return Err(e.into());
            }
            info!(kind = %transport.kind(), "transport started");
            started += 1;
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Drain the worker pool, then stop the transports.
    ///
    /// The pool drains first so responses to in-flight requests still have
    /// a live connection to go out on; requests arriving while draining
    /// are dropped. Transports close their listeners and connections once
    /// the drain completes or the graceful timeout escalates.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.pool.shutdown(ShutdownMode::Graceful);
        for transport in self.transports.lock().iter() {
            transport.stop();
        }
        info!("server stopped");
    }

    /// Whether [`McpServer::start`] succeeded and no stop happened since.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The registry, for runtime additions (grow-only).
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// The resource cache.
    pub fn cache(&self) -> Arc<ResourceCache> {
        Arc::clone(&self.cache)
    }

    /// The rate limiter.
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Worker-pool counters.
    pub fn pool_stats(&self) -> loommcp_runtime::executor::PoolStats {
        self.pool.stats()
    }

    /// Periodic housekeeping: reclaim idle rate-limit buckets and purge
    /// expired cache entries. Callers run this from a timer thread.
    pub fn housekeeping(&self) {
        self.limiter.reclaim();
        self.cache.purge_expired();
    }
}

impl Drop for McpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("name", &self.config.name)
            .field("running", &self.is_running())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Builder for [`McpServer`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    resources: Vec<Resource>,
    templates: Vec<ResourceTemplate>,
    tools: Vec<(Tool, ToolHandler)>,
    resource_handler: Option<ResourceHandler>,
    notification_handler: Option<NotificationHandler>,
}

impl ServerBuilder {
    /// Fresh builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Server name reported by `initialize`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Server version reported by `initialize`.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Require this API key on every message.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    /// Size the worker pool.
    #[must_use]
    pub fn thread_pool(mut self, threads: usize, queue_size: usize) -> Self {
        self.config.thread_count = threads;
        self.config.task_queue_size = queue_size;
        self
    }

    /// Register a resource.
    #[must_use]
    pub fn resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Register a resource template.
    #[must_use]
    pub fn template(mut self, template: ResourceTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Register a tool and its handler.
    #[must_use]
    pub fn tool(mut self, tool: Tool, handler: ToolHandler) -> Self {
        self.tools.push((tool, handler));
        self
    }

    /// Install the resource handler invoked on cache misses.
    #[must_use]
    pub fn resource_handler(mut self, handler: ResourceHandler) -> Self {
        self.resource_handler = Some(handler);
        self
    }

    /// Install the notification handler.
    #[must_use]
    pub fn notification_handler(mut self, handler: NotificationHandler) -> Self {
        self.notification_handler = Some(handler);
        self
    }

    /// Assemble the server and spawn its worker pool.
    ///
    /// # Errors
    ///
    /// [`ServerError::Pool`] when worker threads cannot be spawned.
    pub fn build(self) -> Result<McpServer, ServerError> {
        let config = Arc::new(self.config);

        let registry = Arc::new(Registry::new());
        for resource in self.resources {
            registry.add_resource(resource);
        }
        for template in self.templates {
            registry.add_template(template);
        }
        for (tool, handler) in self.tools {
            registry.add_tool(tool, handler);
        }
        if let Some(handler) = self.resource_handler {
            registry.set_resource_handler(handler);
        }
        if let Some(handler) = self.notification_handler {
            registry.set_notification_handler(handler);
        }

        let cache = Arc::new(ResourceCache::new(config.cache.clone()));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_rules.clone(),
            config.rate_config.clone(),
        ));
        let pool = Arc::new(ThreadPool::with_graceful_timeout(
            config.thread_count,
            config.task_queue_size,
            config.graceful_timeout,
        )?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&limiter),
            Arc::clone(&pool),
        ));

        Ok(McpServer {
            config,
            registry,
            cache,
            limiter,
            pool,
            dispatcher,
            transports: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_registry() {
        let server = McpServer::builder()
            .name("test-server")
            .version("9.9.9")
            .resource(Resource::new("test://r", "r"))
            .tool(
                Tool::new("noop"),
                Arc::new(|_, _| Ok(crate::registry::ToolOutput::ok(Vec::new()))),
            )
            .build()
            .unwrap();
        assert_eq!(server.config().name, "test-server");
        assert_eq!(server.registry().resources().len(), 1);
        assert_eq!(server.registry().tools().len(), 1);
        assert!(!server.is_running());
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let server = McpServer::builder().build().unwrap();
        server.stop();
        assert!(!server.is_running());
    }
}
