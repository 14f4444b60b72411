//! Sliding-window stores.
//!
//! `RedisWindowStore` is the deployment backend: one sorted set per key,
//! members scored by epoch-milliseconds, evicted on every check. Sorted-set
//! commands on a single key are serialized by Redis, which is what makes
//! the counter updates atomic across instances.
//!
//! `MemoryWindowStore` implements the same semantics process-locally for
//! tests and Redis-less development.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use thiserror::Error;

use super::WindowDecision;

/// Per-command deadline for the KV store.
const KV_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("kv store error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("kv store timed out")]
    Timeout,
}

#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Evict members older than the window, then either record `member`
    /// (allowed) or report how long the caller must wait (denied).
    async fn check_and_record(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        max_requests: u64,
    ) -> Result<WindowDecision, StoreError>;

    /// Remove a recorded member (skip-successful mode).
    async fn forget(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Backend liveness, for the readiness probe.
    async fn ping(&self) -> bool;
}

pub struct RedisWindowStore {
    conn: ConnectionManager,
}

impl RedisWindowStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn check_and_record(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        max_requests: u64,
    ) -> Result<WindowDecision, StoreError> {
        let mut conn = self.conn.clone();
        let window_start = now_ms - window_ms;

        let work = async {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(window_start)
                .ignore()
                .cmd("ZCARD")
                .arg(key)
                .query_async(&mut conn)
                .await?;

            if count >= max_requests {
                let ttl_ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
                let wait_ms = if ttl_ms > 0 { ttl_ms.min(window_ms) } else { window_ms };
                return Ok(WindowDecision::Denied {
                    limit: max_requests,
                    retry_after_ms: wait_ms,
                    reset_ms: now_ms + wait_ms,
                });
            }

            let ttl_secs = (window_ms + 999) / 1000;
            redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(key)
                .arg(now_ms)
                .arg(member)
                .ignore()
                .cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;

            Ok(WindowDecision::Allowed {
                limit: max_requests,
                remaining: max_requests - count - 1,
                reset_ms: now_ms + window_ms,
            })
        };

        tokio::time::timeout(KV_TIMEOUT, work)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    async fn forget(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let work = async {
            redis::cmd("ZREM")
                .arg(key)
                .arg(member)
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok(())
        };
        tokio::time::timeout(KV_TIMEOUT, work)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let work = async move {
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
        };
        matches!(tokio::time::timeout(KV_TIMEOUT, work).await, Ok(Ok(_)))
    }
}

struct Window {
    /// (score, member) pairs, oldest first.
    entries: Vec<(i64, String)>,
    expires_at_ms: i64,
}

#[derive(Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, Window>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn check_and_record(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        max_requests: u64,
    ) -> Result<WindowDecision, StoreError> {
        let window_start = now_ms - window_ms;
        let mut window = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            entries: Vec::new(),
            expires_at_ms: now_ms + window_ms,
        });

        // Mirror Redis key expiry before evicting members.
        if window.expires_at_ms <= now_ms {
            window.entries.clear();
        }
        window.entries.retain(|(score, _)| *score >= window_start);

        let count = window.entries.len() as u64;
        if count >= max_requests {
            let wait_ms = (window.expires_at_ms - now_ms).clamp(1, window_ms);
            return Ok(WindowDecision::Denied {
                limit: max_requests,
                retry_after_ms: wait_ms,
                reset_ms: now_ms + wait_ms,
            });
        }

        window.entries.push((now_ms, member.to_string()));
        window.expires_at_ms = now_ms + window_ms;
        Ok(WindowDecision::Allowed {
            limit: max_requests,
            remaining: max_requests - count - 1,
            reset_ms: now_ms + window_ms,
        })
    }

    async fn forget(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(mut window) = self.windows.get_mut(key) {
            window.entries.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_evicts_by_score_and_key_expiry() {
        let store = MemoryWindowStore::new();

        for i in 0..3 {
            let decision = store
                .check_and_record("k", &format!("m{i}"), 1_000 + i, 500, 3)
                .await
                .unwrap();
            assert!(matches!(decision, WindowDecision::Allowed { .. }));
        }
        assert!(matches!(
            store.check_and_record("k", "m3", 1_010, 500, 3).await.unwrap(),
            WindowDecision::Denied { .. }
        ));

        // 600ms later every member's score is out of the window.
        assert!(matches!(
            store.check_and_record("k", "m4", 1_610, 500, 3).await.unwrap(),
            WindowDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn memory_store_reports_remaining_capacity() {
        let store = MemoryWindowStore::new();
        let decision = store.check_and_record("k", "m0", 0, 1_000, 5).await.unwrap();
        assert_eq!(
            decision,
            WindowDecision::Allowed {
                limit: 5,
                remaining: 4,
                reset_ms: 1_000,
            }
        );
    }

    #[tokio::test]
    async fn denied_wait_never_exceeds_the_window() {
        let store = MemoryWindowStore::new();
        store.check_and_record("k", "a", 0, 1_000, 1).await.unwrap();
        let WindowDecision::Denied { retry_after_ms, .. } =
            store.check_and_record("k", "b", 10, 1_000, 1).await.unwrap()
        else {
            panic!("expected denial");
        };
        assert!(retry_after_ms > 0 && retry_after_ms <= 1_000);
    }
}
