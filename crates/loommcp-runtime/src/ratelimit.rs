//! Multi-key, multi-strategy request admission.
//!
//! A limiter holds a prioritized set of rules and a map of per-client
//! buckets. Each incoming request presents the keys it has (client IP,
//! user, API key, custom attribute, or a composite of all of them); the
//! highest-priority matching rule admits or denies via its strategy. No
//! matching rule means allow.
//!
//! The limiter never fails the request path: internal trouble is logged and
//! the request is admitted.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use globset::{Glob, GlobMatcher};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

/// Which request attribute a rule keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Client IP address.
    Ip,
    /// Authenticated user name.
    User,
    /// Presented API key.
    ApiKey,
    /// Caller-defined attribute.
    Custom,
    /// Every presented key joined into one identity; see
    /// [`RequestKeys::composite`].
    Composite,
}

/// Admission strategy for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Counter reset every window; deny above the limit.
    FixedWindow,
    /// Continuous refill; each request spends one token.
    TokenBucket,
    /// Continuous drain; each request adds one unit of level.
    LeakyBucket,
}

/// One admission policy entry.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    /// The request attribute this rule applies to.
    pub key_type: KeyType,
    /// Optional glob over the key value (`*` wildcard); `None` matches all.
    pub pattern: Option<String>,
    /// Admission strategy.
    pub strategy: Strategy,
    /// Requests per window (fixed window), maximum tokens, or capacity.
    pub limit: u32,
    /// Window length; also sets the refill/drain rate (`limit / window`).
    pub window: Duration,
    /// Higher priority wins when several rules match.
    pub priority: u32,
}

impl RateLimitRule {
    /// A fixed-window rule over client IPs, the common case.
    pub fn per_ip(limit: u32, window: Duration) -> Self {
        Self {
            key_type: KeyType::Ip,
            pattern: None,
            strategy: Strategy::FixedWindow,
            limit,
            window,
            priority: 0,
        }
    }

    /// Set the glob pattern.
    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Limiter-wide behavior knobs.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Scale each rule's effective limit by `burst_multiplier`.
    pub burst_enabled: bool,
    /// Multiplier applied when bursting is enabled.
    pub burst_multiplier: f64,
    /// Adjust effective limits from observed denial rates.
    pub dynamic_enabled: bool,
    /// Denial rate above which a rule's effective limit is halved.
    pub tighten_threshold: f64,
    /// Denial rate below which the declared limit is restored.
    pub relax_threshold: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_enabled: false,
            burst_multiplier: 1.5,
            dynamic_enabled: false,
            tighten_threshold: 0.5,
            relax_threshold: 0.1,
        }
    }
}

/// The keys one request presents for admission.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestKeys<'a> {
    /// Client IP.
    pub ip: Option<&'a str>,
    /// Authenticated user.
    pub user: Option<&'a str>,
    /// Presented API key.
    pub api_key: Option<&'a str>,
    /// Caller-defined attribute.
    pub custom: Option<&'a str>,
}

impl<'a> RequestKeys<'a> {
    /// Keys with only a client IP, the common server case.
    pub fn ip(ip: &'a str) -> Self {
        Self {
            ip: Some(ip),
            ..Self::default()
        }
    }

    /// Colon-joined concatenation of every presented key, in
    /// `ip:user:api_key:custom` order. `None` when no key is present.
    pub fn composite(&self) -> Option<String> {
        let parts: Vec<&str> = [self.ip, self.user, self.api_key, self.custom]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(":"))
        }
    }

    fn value_for(&self, key_type: KeyType) -> Option<Cow<'a, str>> {
        match key_type {
            KeyType::Ip => self.ip.map(Cow::Borrowed),
            KeyType::User => self.user.map(Cow::Borrowed),
            KeyType::ApiKey => self.api_key.map(Cow::Borrowed),
            KeyType::Custom => self.custom.map(Cow::Borrowed),
            KeyType::Composite => self.composite().map(Cow::Owned),
        }
    }
}

enum BucketState {
    Fixed { window_start: Instant, count: u32 },
    Tokens { tokens: f64, last_refill: Instant },
    Leaky { level: f64, last_leak: Instant },
}

struct Bucket {
    state: BucketState,
    last_touch: Instant,
}

#[derive(Default)]
struct RuleStats {
    total: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
}

struct CompiledRule {
    rule: RateLimitRule,
    matcher: Option<GlobMatcher>,
    /// Declared limit, possibly tightened by dynamic adjustment.
    effective_limit: AtomicU32,
    stats: RuleStats,
}

/// Snapshot of one rule's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleCounters {
    /// Requests evaluated against the rule.
    pub total: u64,
    /// Requests admitted.
    pub allowed: u64,
    /// Requests denied.
    pub denied: u64,
    /// Current effective limit after dynamic adjustment.
    pub effective_limit: u32,
}

/// Multi-strategy rate limiter.
pub struct RateLimiter {
    /// Sorted by descending priority at construction; read-only afterwards.
    rules: Vec<CompiledRule>,
    buckets: RwLock<HashMap<(usize, String), Arc<Mutex<Bucket>>>>,
    config: RateLimitConfig,
    total: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl RateLimiter {
    /// Compile a rule set. Invalid glob patterns disable that rule's
    /// pattern (it then matches every key value) and are logged.
    pub fn new(rules: Vec<RateLimitRule>, config: RateLimitConfig) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .map(|rule| {
                let matcher = rule.pattern.as_deref().and_then(|p| match Glob::new(p) {
                    Ok(glob) => Some(glob.compile_matcher()),
                    Err(e) => {
                        warn!(pattern = p, error = %e, "invalid rate-limit pattern ignored");
                        None
                    }
                });
                CompiledRule {
                    effective_limit: AtomicU32::new(rule.limit),
                    matcher,
                    rule,
                    stats: RuleStats::default(),
                }
            })
            .collect();
        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Self {
            rules: compiled,
            buckets: RwLock::new(HashMap::new()),
            config,
            total: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    /// A limiter with no rules; admits everything.
    pub fn permissive() -> Self {
        Self::new(Vec::new(), RateLimitConfig::default())
    }

    /// Admit or deny one request.
    pub fn check(&self, keys: RequestKeys<'_>) -> bool {
        self.check_at(keys, Instant::now())
    }

    /// [`RateLimiter::check`] with an injected clock, for tests.
    pub fn check_at(&self, keys: RequestKeys<'_>, now: Instant) -> bool {
        let Some((index, value)) = self.select_rule(keys) else {
            return true;
        };
        let bucket = self.bucket_for(index, &value, now);
        let allowed = {
            let compiled = &self.rules[index];
            let mut bucket = bucket.lock();
            bucket.last_touch = now;
            let limit = self.admission_limit(compiled);
            apply_strategy(&mut bucket.state, limit, compiled.rule.window, now)
        };
        self.record(index, allowed);
        if !allowed {
            debug!(rule = index, key = %value, "request denied by rate limiter");
        }
        allowed
    }

    /// Remove buckets untouched for longer than twice their rule's window.
    pub fn reclaim(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        buckets.retain(|(rule_index, _), bucket| {
            let horizon = self.rules[*rule_index].rule.window * 2;
            now.duration_since(bucket.lock().last_touch) <= horizon
        });
    }

    /// Global counters: `(total, allowed, denied)`.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.allowed.load(Ordering::Relaxed),
            self.denied.load(Ordering::Relaxed),
        )
    }

    /// Per-rule counters, in priority order.
    pub fn rule_counters(&self) -> Vec<RuleCounters> {
        self.rules
            .iter()
            .map(|r| RuleCounters {
                total: r.stats.total.load(Ordering::Relaxed),
                allowed: r.stats.allowed.load(Ordering::Relaxed),
                denied: r.stats.denied.load(Ordering::Relaxed),
                effective_limit: r.effective_limit.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Tracked bucket count.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    fn select_rule<'a>(&self, keys: RequestKeys<'a>) -> Option<(usize, Cow<'a, str>)> {
        self.rules.iter().enumerate().find_map(|(index, compiled)| {
            let value = keys.value_for(compiled.rule.key_type)?;
            match &compiled.matcher {
                Some(matcher) if !matcher.is_match(&*value) => None,
                _ => Some((index, value)),
            }
        })
    }

    fn bucket_for(&self, rule_index: usize, value: &str, now: Instant) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(&(rule_index, value.to_owned())) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write();
        Arc::clone(
            buckets
                .entry((rule_index, value.to_owned()))
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Bucket {
                        state: initial_state(
                            self.rules[rule_index].rule.strategy,
                            self.rules[rule_index].rule.limit,
                            now,
                        ),
                        last_touch: now,
                    }))
                }),
        )
    }

    fn admission_limit(&self, compiled: &CompiledRule) -> u32 {
        let mut limit = compiled.effective_limit.load(Ordering::Relaxed);
        if self.config.burst_enabled {
            limit = ((f64::from(limit)) * self.config.burst_multiplier).floor() as u32;
        }
        limit.max(1)
    }

    fn record(&self, rule_index: usize, allowed: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let stats = &self.rules[rule_index].stats;
        stats.total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            stats.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            stats.denied.fetch_add(1, Ordering::Relaxed);
        }
        if self.config.dynamic_enabled {
            self.adjust_effective_limit(rule_index);
        }
    }

    /// Denial rate is `denied / total` over saturating unsigned counters,
    /// always within `[0, 1]`.
    fn adjust_effective_limit(&self, rule_index: usize) {
        let compiled = &self.rules[rule_index];
        let total = compiled.stats.total.load(Ordering::Relaxed);
        if total < 10 {
            return;
        }
        let denied = compiled.stats.denied.load(Ordering::Relaxed);
        let denial_rate = denied as f64 / total as f64;
        let declared = compiled.rule.limit;
        if denial_rate > self.config.tighten_threshold {
            compiled
                .effective_limit
                .store((declared / 2).max(1), Ordering::Relaxed);
        } else if denial_rate < self.config.relax_threshold {
            compiled.effective_limit.store(declared, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (total, allowed, denied) = self.counters();
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules.len())
            .field("buckets", &self.bucket_count())
            .field("total", &total)
            .field("allowed", &allowed)
            .field("denied", &denied)
            .finish()
    }
}

fn initial_state(strategy: Strategy, limit: u32, now: Instant) -> BucketState {
    match strategy {
        Strategy::FixedWindow => BucketState::Fixed {
            window_start: now,
            count: 0,
        },
        Strategy::TokenBucket => BucketState::Tokens {
            tokens: f64::from(limit),
            last_refill: now,
        },
        Strategy::LeakyBucket => BucketState::Leaky {
            level: 0.0,
            last_leak: now,
        },
    }
}

fn apply_strategy(state: &mut BucketState, limit: u32, window: Duration, now: Instant) -> bool {
    let window_secs = window.as_secs_f64().max(f64::EPSILON);
    let rate = f64::from(limit) / window_secs;
    match state {
        BucketState::Fixed {
            window_start,
            count,
        } => {
            if now.duration_since(*window_start) >= window {
                *window_start = now;
                *count = 0;
            }
            if *count < limit {
                *count += 1;
                true
            } else {
                false
            }
        }
        BucketState::Tokens {
            tokens,
            last_refill,
        } => {
            let elapsed = now.duration_since(*last_refill).as_secs_f64();
            *tokens = (*tokens + elapsed * rate).min(f64::from(limit));
            *last_refill = now;
            if *tokens >= 1.0 {
                *tokens -= 1.0;
                true
            } else {
                false
            }
        }
        BucketState::Leaky { level, last_leak } => {
            let elapsed = now.duration_since(*last_leak).as_secs_f64();
            *level = (*level - elapsed * rate).max(0.0);
            *last_leak = now;
            if *level + 1.0 <= f64::from(limit) {
                *level += 1.0;
                true
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_rule(limit: u32, window_ms: u64) -> RateLimitRule {
        RateLimitRule::per_ip(limit, Duration::from_millis(window_ms))
    }

    #[test]
    fn no_rules_allows_everything() {
        let limiter = RateLimiter::permissive();
        assert!(limiter.check(RequestKeys::ip("10.0.0.1")));
    }

    #[test]
    fn fixed_window_denies_over_limit_and_resets() {
        let limiter = RateLimiter::new(vec![fixed_rule(3, 2000)], RateLimitConfig::default());
        let now = Instant::now();
        let keys = RequestKeys::ip("10.0.0.1");
        assert!(limiter.check_at(keys, now));
        assert!(limiter.check_at(keys, now));
        assert!(limiter.check_at(keys, now));
        assert!(!limiter.check_at(keys, now));
        // A new window admits again.
        assert!(limiter.check_at(keys, now + Duration::from_millis(2001)));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(vec![fixed_rule(1, 1000)], RateLimitConfig::default());
        let now = Instant::now();
        assert!(limiter.check_at(RequestKeys::ip("10.0.0.1"), now));
        assert!(limiter.check_at(RequestKeys::ip("10.0.0.2"), now));
        assert!(!limiter.check_at(RequestKeys::ip("10.0.0.1"), now));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let rule = RateLimitRule {
            strategy: Strategy::TokenBucket,
            ..fixed_rule(2, 1000)
        };
        let limiter = RateLimiter::new(vec![rule], RateLimitConfig::default());
        let now = Instant::now();
        let keys = RequestKeys::ip("a");
        // Bucket starts full with two tokens.
        assert!(limiter.check_at(keys, now));
        assert!(limiter.check_at(keys, now));
        assert!(!limiter.check_at(keys, now));
        // Half a window accrues one token.
        assert!(limiter.check_at(keys, now + Duration::from_millis(500)));
        assert!(!limiter.check_at(keys, now + Duration::from_millis(500)));
    }

    #[test]
    fn leaky_bucket_drains_over_time() {
        let rule = RateLimitRule {
            strategy: Strategy::LeakyBucket,
            ..fixed_rule(2, 1000)
        };
        let limiter = RateLimiter::new(vec![rule], RateLimitConfig::default());
        let now = Instant::now();
        let keys = RequestKeys::ip("a");
        assert!(limiter.check_at(keys, now));
        assert!(limiter.check_at(keys, now));
        assert!(!limiter.check_at(keys, now));
        // One full window drains the bucket completely.
        assert!(limiter.check_at(keys, now + Duration::from_millis(1100)));
    }

    #[test]
    fn priority_selects_the_stricter_rule() {
        let lenient = fixed_rule(100, 1000);
        let strict = fixed_rule(1, 1000).with_priority(10);
        let limiter = RateLimiter::new(vec![lenient, strict], RateLimitConfig::default());
        let now = Instant::now();
        let keys = RequestKeys::ip("10.0.0.1");
        assert!(limiter.check_at(keys, now));
        assert!(!limiter.check_at(keys, now));
    }

    #[test]
    fn pattern_restricts_rule_to_matching_keys() {
        let rule = fixed_rule(1, 1000).with_pattern("10.0.*");
        let limiter = RateLimiter::new(vec![rule], RateLimitConfig::default());
        let now = Instant::now();
        assert!(limiter.check_at(RequestKeys::ip("10.0.0.9"), now));
        assert!(!limiter.check_at(RequestKeys::ip("10.0.0.9"), now));
        // Non-matching IPs fall through to the default allow.
        assert!(limiter.check_at(RequestKeys::ip("192.168.1.1"), now));
        assert!(limiter.check_at(RequestKeys::ip("192.168.1.1"), now));
    }

    #[test]
    fn composite_rule_keys_on_the_joined_identity() {
        let rule = RateLimitRule {
            key_type: KeyType::Composite,
            ..fixed_rule(1, 1000)
        };
        let limiter = RateLimiter::new(vec![rule], RateLimitConfig::default());
        let now = Instant::now();
        let alice = RequestKeys {
            ip: Some("10.0.0.1"),
            user: Some("alice"),
            ..RequestKeys::default()
        };
        let bob = RequestKeys {
            ip: Some("10.0.0.1"),
            user: Some("bob"),
            ..RequestKeys::default()
        };
        assert!(limiter.check_at(alice, now));
        assert!(!limiter.check_at(alice, now));
        // Same IP under a different user is a distinct composite key.
        assert!(limiter.check_at(bob, now));
        assert_eq!(limiter.bucket_count(), 2);
        // A request presenting no keys cannot match a composite rule.
        assert!(limiter.check_at(RequestKeys::default(), now));
    }

    #[test]
    fn composite_value_joins_presented_keys_in_order() {
        let keys = RequestKeys {
            ip: Some("10.0.0.1"),
            api_key: Some("k1"),
            ..RequestKeys::default()
        };
        assert_eq!(keys.composite().as_deref(), Some("10.0.0.1:k1"));
        assert_eq!(RequestKeys::default().composite(), None);
    }

    #[test]
    fn burst_scales_the_limit() {
        let config = RateLimitConfig {
            burst_enabled: true,
            burst_multiplier: 2.0,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(vec![fixed_rule(2, 1000)], config);
        let now = Instant::now();
        let keys = RequestKeys::ip("a");
        for _ in 0..4 {
            assert!(limiter.check_at(keys, now));
        }
        assert!(!limiter.check_at(keys, now));
    }

    #[test]
    fn dynamic_tightening_halves_the_limit() {
        let config = RateLimitConfig {
            dynamic_enabled: true,
            tighten_threshold: 0.3,
            relax_threshold: 0.01,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(vec![fixed_rule(4, 1000)], config);
        let now = Instant::now();
        let keys = RequestKeys::ip("a");
        // Saturate well past the limit so the denial rate crosses 0.3.
        for _ in 0..20 {
            let _ = limiter.check_at(keys, now);
        }
        assert_eq!(limiter.rule_counters()[0].effective_limit, 2);
    }

    #[test]
    fn reclaim_drops_idle_buckets() {
        let limiter = RateLimiter::new(vec![fixed_rule(5, 1)], RateLimitConfig::default());
        assert!(limiter.check(RequestKeys::ip("a")));
        assert_eq!(limiter.bucket_count(), 1);
        std::thread::sleep(Duration::from_millis(10));
        limiter.reclaim();
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn counters_track_allow_and_deny() {
        let limiter = RateLimiter::new(vec![fixed_rule(1, 1000)], RateLimitConfig::default());
        let now = Instant::now();
        let keys = RequestKeys::ip("a");
        let _ = limiter.check_at(keys, now);
        let _ = limiter.check_at(keys, now);
        assert_eq!(limiter.counters(), (2, 1, 1));
    }
}
