//! Per-user rate limiting on the shared store.
//!
//! A fixed-window counter keyed by `(user, window)`: the first increment
//! in a window sets the window TTL, and the request is denied once the
//! counter exceeds the user's tier limit. Store outages fail open with a
//! warning — rate limiting is a guard, not a correctness requirement.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::store::SharedStore;

const WINDOW_SECS: i64 = 60;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Seconds until the current window rolls over.
    pub retry_after_secs: u64,
    /// Requests left in the window after this one (zero when denied).
    pub remaining: u32,
}

/// Token-bucket rate limiter over the shared store.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a limiter with the configured tiers.
    pub fn new(store: Arc<dyn SharedStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Spend `cost` requests from the user's current window.
    pub async fn check(&self, user_id: &str, cost: u32) -> RateDecision {
        let now = chrono::Utc::now().timestamp();
        let window = now / WINDOW_SECS;
        let retry_after_secs = (WINDOW_SECS - (now % WINDOW_SECS)).max(1) as u64;
        let limit = self.config.limit_for(user_id);
        let key = format!("ratelimit:{user_id}:{window}");

        let count = match self
            .store
            .incr(&key, i64::from(cost), Some(Duration::from_secs(WINDOW_SECS as u64)))
            .await
        {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, user_id = %user_id, "rate limit check failed open");
                return RateDecision {
                    allowed: true,
                    retry_after_secs,
                    remaining: 0,
                };
            }
        };

        let allowed = count <= i64::from(limit);
        if !allowed {
            tracing::debug!(
                user_id = %user_id,
                count,
                limit,
                "rate limit exceeded",
            );
        }

        RateDecision {
            allowed,
            retry_after_secs,
            remaining: u32::try_from(i64::from(limit) - count).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::UnreachableStore;
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn limiter_with(limit: u32) -> RateLimiter {
        let mut tiers = HashMap::new();
        tiers.insert("free".to_string(), limit);
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            RateLimitConfig {
                tiers,
                default_tier: "free".to_string(),
                user_tiers: HashMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let limiter = limiter_with(3);

        for i in 0..3 {
            let decision = limiter.check("u1", 1).await;
            assert!(decision.allowed, "request {i} should pass");
        }

        let decision = limiter.check("u1", 1).await;
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs >= 1);
        assert!(decision.retry_after_secs <= 60);
    }

    #[tokio::test]
    async fn remaining_counts_down() {
        let limiter = limiter_with(3);
        assert_eq!(limiter.check("u1", 1).await.remaining, 2);
        assert_eq!(limiter.check("u1", 1).await.remaining, 1);
        assert_eq!(limiter.check("u1", 1).await.remaining, 0);
    }

    #[tokio::test]
    async fn users_have_independent_windows() {
        let limiter = limiter_with(1);
        assert!(limiter.check("u1", 1).await.allowed);
        assert!(!limiter.check("u1", 1).await.allowed);
        assert!(limiter.check("u2", 1).await.allowed);
    }

    #[tokio::test]
    async fn tier_mapping_changes_limit() {
        let mut tiers = HashMap::new();
        tiers.insert("free".to_string(), 1);
        tiers.insert("pro".to_string(), 100);
        let mut user_tiers = HashMap::new();
        user_tiers.insert("vip".to_string(), "pro".to_string());

        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            RateLimitConfig {
                tiers,
                default_tier: "free".to_string(),
                user_tiers,
            },
        );

        assert!(limiter.check("vip", 1).await.allowed);
        assert!(limiter.check("vip", 1).await.allowed);

        assert!(limiter.check("walk-in", 1).await.allowed);
        assert!(!limiter.check("walk-in", 1).await.allowed);
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let limiter = RateLimiter::new(Arc::new(UnreachableStore), RateLimitConfig::default());
        let decision = limiter.check("u1", 1).await;
        assert!(decision.allowed);
    }
}
