//! Server configuration.

use std::time::Duration;

use loommcp_core::DEFAULT_MAX_MESSAGE_SIZE;
use loommcp_runtime::cache::CacheConfig;
use loommcp_runtime::ratelimit::{RateLimitConfig, RateLimitRule};

/// Default worker-thread count.
pub const DEFAULT_THREAD_COUNT: usize = 4;

/// Default per-worker task-queue depth.
pub const DEFAULT_TASK_QUEUE_SIZE: usize = 64;

/// Default bound on draining in-flight requests at shutdown.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

/// Behavior knobs for an [`crate::McpServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name reported by `initialize`.
    pub name: String,
    /// Server version reported by `initialize`.
    pub version: String,
    /// Incoming message size limit; larger payloads are dropped.
    pub max_message_size: usize,
    /// When set, every message must carry a matching `apiKey` field.
    pub api_key: Option<String>,
    /// Worker threads in the dispatch pool.
    pub thread_count: usize,
    /// Per-worker task-queue depth.
    pub task_queue_size: usize,
    /// Resource cache tuning.
    pub cache: CacheConfig,
    /// Rate-limit rules; empty means no limiting.
    pub rate_rules: Vec<RateLimitRule>,
    /// Rate-limiter behavior.
    pub rate_config: RateLimitConfig,
    /// Bound on draining in-flight requests at shutdown.
    pub graceful_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "loommcp".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            api_key: None,
            thread_count: DEFAULT_THREAD_COUNT,
            task_queue_size: DEFAULT_TASK_QUEUE_SIZE,
            cache: CacheConfig::default(),
            rate_rules: Vec::new(),
            rate_config: RateLimitConfig::default(),
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert!(config.api_key.is_none());
        assert!(config.rate_rules.is_empty());
        assert_eq!(config.graceful_timeout, Duration::from_secs(5));
    }
}
