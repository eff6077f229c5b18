// Rate Limiting Module
// Fixed-window per-key throttling for webhook and public debug surfaces,
// plus the authentication-failure tracker used by live connections.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::security::SecurityAuditor;

/// Rate limit configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms.min(i64::MAX as u64) as i64)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_ms: 60_000,
        }
    }
}

/// Rate limit key type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Webhook invocations of one endpoint from one address
    Webhook { endpoint: String, ip: String },
    /// Public debug runs of one endpoint from one address
    PublicDebug { endpoint: String, ip: String },
    /// Public catalogue listing per address
    Catalogue(String),
    /// Failed live-connection authentications per address
    LiveAuth(String),
}

impl RateLimitKey {
    pub fn as_string(&self) -> String {
        match self {
            RateLimitKey::Webhook { endpoint, ip } => format!("webhook:{}:{}", endpoint, ip),
            RateLimitKey::PublicDebug { endpoint, ip } => {
                format!("public_debug:{}:{}", endpoint, ip)
            }
            RateLimitKey::Catalogue(ip) => format!("catalogue:{}", ip),
            RateLimitKey::LiveAuth(ip) => format!("live_auth:{}", ip),
        }
    }
}

/// Outcome of a limiter check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    reset_at: DateTime<Utc>,
}

fn retry_after_secs(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let remaining_ms = (reset_at - now).num_milliseconds().max(0) as u64;
    remaining_ms.div_ceil(1000).max(1)
}

/// Fixed-window rate limiter. Each key owns one window; updates to a key
/// are serialized by the map shard lock.
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: DashMap<String, WindowEntry>,
    auditor: Option<SecurityAuditor>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            auditor: None,
        }
    }

    /// Set security auditor for logging
    pub fn with_security_auditor(mut self, auditor: SecurityAuditor) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn check(&self, key: &RateLimitKey) -> RateLimitDecision {
        self.check_at(key, Utc::now())
    }

    /// Counts one request for `key` at `now`. Rejected requests keep
    /// incrementing the counter; the window end never moves.
    pub fn check_at(&self, key: &RateLimitKey, now: DateTime<Utc>) -> RateLimitDecision {
        let key_str = key.as_string();
        let decision = {
            let mut entry = self.entries.entry(key_str.clone()).or_insert(WindowEntry {
                count: 0,
                reset_at: now,
            });

            if now >= entry.reset_at {
                entry.count = 1;
                entry.reset_at = now + self.config.window();
                RateLimitDecision::Allowed {
                    remaining: self.config.max_requests.saturating_sub(1),
                }
            } else {
                entry.count = entry.count.saturating_add(1);
                if entry.count > self.config.max_requests {
                    RateLimitDecision::Limited {
                        retry_after_secs: retry_after_secs(entry.reset_at, now),
                    }
                } else {
                    RateLimitDecision::Allowed {
                        remaining: self.config.max_requests - entry.count,
                    }
                }
            }
        };

        match &decision {
            RateLimitDecision::Limited { retry_after_secs } => {
                warn!("Rate limit exceeded for key: {}", key_str);
                if let Some(auditor) = &self.auditor {
                    auditor.log_rate_limited(&key_str, *retry_after_secs);
                }
            }
            RateLimitDecision::Allowed { .. } => {
                debug!("Rate limit check passed for key: {}", key_str);
            }
        }

        decision
    }

    /// Whether `key` is currently over its limit, without counting a request.
    pub fn is_limited_at(&self, key: &RateLimitKey, now: DateTime<Utc>) -> bool {
        self.entries
            .get(&key.as_string())
            .map(|entry| now < entry.reset_at && entry.count > self.config.max_requests)
            .unwrap_or(false)
    }


    /// Drops every entry whose window has ended. Returns how many were removed.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.reset_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-address authentication failure counter for live connections,
/// kept apart from the request limiters.
pub struct AuthFailureTracker {
    limiter: RateLimiter,
}

impl AuthFailureTracker {
    pub fn new(max_failures: u32, window_ms: u64) -> Self {
        Self {
            limiter: RateLimiter::new(RateLimitConfig::new(max_failures, window_ms)),
        }
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.limiter
            .is_limited_at(&RateLimitKey::LiveAuth(ip.to_string()), Utc::now())
    }

    /// Records a failure. Returns true once the threshold is exceeded.
    pub fn record_failure(&self, ip: &str) -> bool {
        self.record_failure_at(ip, Utc::now())
    }

    pub fn record_failure_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        !self
            .limiter
            .check_at(&RateLimitKey::LiveAuth(ip.to_string()), now)
            .is_allowed()
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        self.limiter.sweep_expired_at(now)
    }
}

/// Anything holding expiring per-key state.
pub trait Sweepable: Send + Sync {
    fn sweep(&self, now: DateTime<Utc>) -> usize;
}

impl Sweepable for RateLimiter {
    fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.sweep_expired_at(now)
    }
}

impl Sweepable for AuthFailureTracker {
    fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.sweep_expired_at(now)
    }
}

/// Periodically evicts expired windows so key churn cannot grow the maps
/// without bound.
pub fn spawn_sweeper(
    targets: Vec<Arc<dyn Sweepable>>,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let removed: usize = targets.iter().map(|target| target.sweep(now)).sum();
            if removed > 0 {
                debug!("Swept {} expired rate limit entries", removed);
            }
        }
    })
}
