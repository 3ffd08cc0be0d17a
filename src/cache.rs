use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};

/// Two-tier cache: in-memory DashMap (tier 1) backed by Redis (tier 2).
///
/// The storage backend is the source of truth; callers decide what to do on
/// a miss. Redis is optional — without it the cache degrades to local-only,
/// which is the documented degraded mode for a cache outage.
#[derive(Clone)]
pub struct TieredCache {
    local: Arc<DashMap<String, (String, Instant)>>,
    redis: Option<ConnectionManager>,
}

impl TieredCache {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            redis,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // tier 1: in-memory with expiry
        if let Some(entry) = self.local.get(key) {
            let (value, expires_at) = entry.value();
            if Instant::now() < *expires_at {
                return serde_json::from_str(value).ok();
            }
            drop(entry);
            self.local.remove(key);
        }

        // tier 2: redis (TTL is server-side)
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            if let Ok(Some(v)) = conn.get::<_, Option<String>>(key).await {
                // Re-populate tier 1 with a short expiry; redis owns the real TTL
                self.local
                    .insert(key.to_string(), (v.clone(), Instant::now() + Duration::from_secs(60)));
                return serde_json::from_str(&v).ok();
            }
        }

        None
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        self.local.insert(
            key.to_string(),
            (json.clone(), Instant::now() + Duration::from_secs(ttl_secs)),
        );

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            conn.set_ex::<_, _, ()>(key, json, ttl_secs).await?;
        }
        Ok(())
    }

    /// Remove a key from both tiers. Invalidation on credential mutation is
    /// authoritative, so the redis delete is not best-effort.
    pub async fn invalidate(&self, key: &str) -> anyhow::Result<()> {
        self.local.remove(key);
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            conn.del::<_, ()>(key).await?;
        }
        Ok(())
    }

    pub fn invalidate_local(&self, key: &str) {
        self.local.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_set_get() {
        let cache = TieredCache::new(None);
        cache.set("k", &42u32, 60).await.unwrap();
        assert_eq!(cache.get::<u32>("k").await, Some(42));
    }

    #[tokio::test]
    async fn test_local_expiry() {
        let cache = TieredCache::new(None);
        cache.set("k", &1u32, 0).await.unwrap();
        // TTL 0 ⇒ already expired on read
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = TieredCache::new(None);
        cache.set("k", &"v".to_string(), 60).await.unwrap();
        cache.invalidate("k").await.unwrap();
        assert_eq!(cache.get::<String>("k").await, None);
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        let cache = TieredCache::new(None);
        assert_eq!(cache.get::<u32>("absent").await, None);
    }
}
