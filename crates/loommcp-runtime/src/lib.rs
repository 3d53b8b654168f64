//! # loommcp-runtime
//!
//! The execution layer of the loommcp SDK: a work-stealing thread pool that
//! runs request handlers, a TTL cache consulted by `read_resource`, and a
//! multi-strategy rate limiter applied before dispatch.
//!
//! All three are in-process and thread-safe; none persist anything.

pub mod cache;
pub mod executor;
pub mod ratelimit;

pub use cache::{CacheConfig, CacheStats, ResourceCache};
pub use executor::{PoolError, PoolStats, ShutdownMode, ThreadPool};
pub use ratelimit::{
    KeyType, RateLimitConfig, RateLimitRule, RateLimiter, RequestKeys, Strategy,
};
