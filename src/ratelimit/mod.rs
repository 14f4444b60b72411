//! Distributed sliding-window rate limiting.
//!
//! The middleware asks a [`RateLimiter`] for a decision; the limiter
//! delegates the window bookkeeping to a [`store::WindowStore`] so the
//! backing can be Redis in deployments and in-memory in tests.

pub mod middleware;
pub mod store;

use std::sync::Arc;

use crate::config::RateLimitConfig;
use store::{StoreError, WindowStore};

/// The decision for one request against one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowDecision {
    /// Admitted; carries the values for the `X-RateLimit-*` headers.
    Allowed {
        limit: u64,
        remaining: u64,
        reset_ms: i64,
    },
    /// Over the limit; carries the values for `Retry-After` and the
    /// rate-limit headers.
    Denied {
        limit: u64,
        retry_after_ms: i64,
        reset_ms: i64,
    },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Slide the window for `key` and try to record `member` in it.
    pub async fn check(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
    ) -> Result<WindowDecision, StoreError> {
        self.store
            .check_and_record(
                key,
                member,
                now_ms,
                self.config.window_ms,
                self.config.max_requests,
            )
            .await
    }

    /// Uncount a previously recorded member (skip-successful mode).
    pub async fn forget(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.store.forget(key, member).await
    }

    pub async fn ping(&self) -> bool {
        self.store.ping().await
    }

    pub fn fail_closed(&self) -> bool {
        self.config.fail_closed
    }

    pub fn skip_successful(&self) -> bool {
        self.config.skip_successful
    }

    pub fn window_ms(&self) -> i64 {
        self.config.window_ms
    }

    /// Default per-IP key scheme.
    pub fn ip_key(ip: &str, route: &str) -> String {
        format!("rate_limit:{ip}:{route}")
    }

    /// Authenticated per-user key scheme.
    pub fn user_key(user_id: &str, route: &str) -> String {
        format!("rate_limit:user:{user_id}:{route}")
    }
}

#[cfg(test)]
mod tests {
    use super::store::MemoryWindowStore;
    use super::*;

    fn limiter(max_requests: u64, window_ms: i64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryWindowStore::new()),
            RateLimitConfig {
                window_ms,
                max_requests,
                fail_closed: false,
                skip_successful: false,
            },
        )
    }

    #[tokio::test]
    async fn admits_up_to_the_limit_then_denies() {
        let limiter = limiter(10, 60_000);
        let key = RateLimiter::ip_key("1.2.3.4", "/tokens");
        let now = 1_000_000;

        for i in 0..10 {
            match limiter.check(&key, &format!("req-{i}"), now + i as i64).await.unwrap() {
                WindowDecision::Allowed { remaining, .. } => {
                    assert_eq!(remaining, 10 - i as u64 - 1);
                }
                denied => panic!("request {i} unexpectedly denied: {denied:?}"),
            }
        }

        match limiter.check(&key, "req-10", now + 100).await.unwrap() {
            WindowDecision::Denied {
                limit,
                retry_after_ms,
                ..
            } => {
                assert_eq!(limit, 10);
                assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
            }
            allowed => panic!("11th request admitted: {allowed:?}"),
        }
    }

    #[tokio::test]
    async fn old_entries_slide_out_of_the_window() {
        let limiter = limiter(2, 1_000);
        let key = RateLimiter::ip_key("1.2.3.4", "/tokens");

        assert!(matches!(
            limiter.check(&key, "a", 10_000).await.unwrap(),
            WindowDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check(&key, "b", 10_100).await.unwrap(),
            WindowDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check(&key, "c", 10_200).await.unwrap(),
            WindowDecision::Denied { .. }
        ));

        // One window later both members have expired.
        assert!(matches!(
            limiter.check(&key, "d", 11_201).await.unwrap(),
            WindowDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn forgetting_a_member_frees_a_slot() {
        let limiter = limiter(1, 60_000);
        let key = RateLimiter::ip_key("1.2.3.4", "/tokens");

        assert!(matches!(
            limiter.check(&key, "a", 5_000).await.unwrap(),
            WindowDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check(&key, "b", 5_001).await.unwrap(),
            WindowDecision::Denied { .. }
        ));

        limiter.forget(&key, "a").await.unwrap();
        assert!(matches!(
            limiter.check(&key, "c", 5_002).await.unwrap(),
            WindowDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn keys_are_scoped_per_principal_and_route() {
        let limiter = limiter(1, 60_000);

        assert!(matches!(
            limiter
                .check(&RateLimiter::ip_key("1.1.1.1", "/tokens"), "a", 0)
                .await
                .unwrap(),
            WindowDecision::Allowed { .. }
        ));
        // Different IP and different route both get fresh windows.
        assert!(matches!(
            limiter
                .check(&RateLimiter::ip_key("2.2.2.2", "/tokens"), "b", 0)
                .await
                .unwrap(),
            WindowDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter
                .check(&RateLimiter::ip_key("1.1.1.1", "/tokens/redeem"), "c", 0)
                .await
                .unwrap(),
            WindowDecision::Allowed { .. }
        ));

        assert_eq!(
            RateLimiter::user_key("u-9", "/tokens"),
            "rate_limit:user:u-9:/tokens"
        );
    }
}
