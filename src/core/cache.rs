//! Response cache for successful GET requests.
//!
//! Only paths under a configured prefix with a non-zero TTL are cached.
//! Staleness is checked on every read; there is no background sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::CacheConfig;
use crate::utils::{format_rate_limit_key, glob_match};
use super::store::{KvStore, StoreError};

const PREFIX: &str = "cache";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: String,
    pub query: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: String,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub routes: usize,
}

pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    /// (prefix, ttl seconds), longest prefix first
    routes: Vec<(String, u64)>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KvStore>, config: &CacheConfig) -> Self {
        let mut routes: Vec<(String, u64)> = config
            .routes
            .iter()
            .map(|(prefix, ttl)| (prefix.clone(), *ttl))
            .collect();
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self {
            store,
            routes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// TTL for a GET to `path`, or `None` when the path bypasses the cache.
    pub fn ttl_for(&self, method: &str, path: &str) -> Option<Duration> {
        if !method.eq_ignore_ascii_case("GET") {
            return None;
        }
        self.routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .and_then(|(_, ttl)| (*ttl > 0).then(|| Duration::seconds(*ttl as i64)))
    }

    /// Stable key over the normalised path and the sorted query pairs.
    pub fn cache_key(path: &str, query: &str) -> String {
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();
        let normalized_query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();

        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update(b"?");
        hasher.update(normalized_query.as_bytes());
        format_rate_limit_key(PREFIX, &format!("{:x}", hasher.finalize()))
    }

    /// Fresh entry for this request, if any. Stale entries are dropped on sight.
    pub async fn lookup(&self, path: &str, query: &str) -> Option<CacheEntry> {
        let key = Self::cache_key(path, query);
        let entry = match self.store.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<CacheEntry>(&json) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache lookup failed: {}", e);
                None
            }
        };

        match entry {
            Some(entry) if entry.is_fresh_at(Utc::now()) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("guard_cache_hits_total");
                Some(entry)
            }
            stale => {
                if stale.is_some() {
                    let _ = self.store.delete(&key).await;
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("guard_cache_misses_total");
                None
            }
        }
    }

    /// Store a 200 response. Other statuses and non-UTF-8 bodies are ignored.
    #[allow(clippy::too_many_arguments)]
    pub async fn store(
        &self,
        path: &str,
        query: &str,
        status: u16,
        headers: Vec<(String, String)>,
        content_type: Option<String>,
        body: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if status != 200 {
            return Ok(false);
        }
        let body = match std::str::from_utf8(body) {
            Ok(body) => body.to_string(),
            Err(_) => {
                debug!("Not caching binary response for {}", path);
                return Ok(false);
            }
        };
        let entry = CacheEntry {
            path: path.to_string(),
            query: query.to_string(),
            status,
            headers,
            content_type,
            body,
            expires_at: Utc::now() + ttl,
        };
        let json = serde_json::to_string(&entry)?;
        self.store
            .set(&Self::cache_key(path, query), &json, ttl.to_std().ok())
            .await?;
        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Remove cached responses whose path matches `pattern` (glob). Returns the number removed.
    pub async fn flush(&self, pattern: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in self.store.keys(&format!("{}:*", PREFIX)).await? {
            let matches = match self.store.get(&key).await? {
                Some(json) => serde_json::from_str::<CacheEntry>(&json)
                    .map(|e| glob_match(pattern, &e.path))
                    .unwrap_or(true),
                None => false,
            };
            if matches {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }
        info!("Flushed {} cached responses matching {}", removed, pattern);
        Ok(removed)
    }

    /// Drop process-local cached responses.
    pub fn clear_local(&self) -> usize {
        self.store.purge_local(&[PREFIX])
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            backend: self.store.backend(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            routes: self.routes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::local_store::LocalStore;
    use std::collections::HashMap;

    fn cache(routes: &[(&str, u64)]) -> ResponseCache {
        let config = CacheConfig {
            routes: routes
                .iter()
                .map(|(p, t)| (p.to_string(), *t))
                .collect::<HashMap<_, _>>(),
        };
        ResponseCache::new(Arc::new(LocalStore::default()), &config)
    }

    #[test]
    fn test_ttl_for_longest_prefix_and_method() {
        let cache = cache(&[("/api", 10), ("/api/products", 300), ("/api/cart", 0)]);
        assert_eq!(cache.ttl_for("GET", "/api/products/1"), Some(Duration::seconds(300)));
        assert_eq!(cache.ttl_for("GET", "/api/orders"), Some(Duration::seconds(10)));
        assert_eq!(cache.ttl_for("GET", "/api/cart"), None);
        assert_eq!(cache.ttl_for("POST", "/api/products/1"), None);
        assert_eq!(cache.ttl_for("GET", "/checkout"), None);
    }

    #[test]
    fn test_cache_key_normalisation() {
        assert_eq!(
            ResponseCache::cache_key("/cached/x/", "b=2&a=1"),
            ResponseCache::cache_key("/cached/x", "a=1&b=2")
        );
        assert_ne!(
            ResponseCache::cache_key("/cached/x", "id=1"),
            ResponseCache::cache_key("/cached/x", "id=2")
        );
        assert!(ResponseCache::cache_key("/", "").starts_with("cache:"));
    }

    #[tokio::test]
    async fn test_store_lookup_and_expiry() {
        let cache = cache(&[("/cached", 1)]);
        assert!(cache.lookup("/cached/x", "id=1").await.is_none());

        let stored = cache
            .store("/cached/x", "id=1", 200, vec![], Some("application/json".into()), b"{\"id\":1}", Duration::milliseconds(1100))
            .await
            .unwrap();
        assert!(stored);

        let hit = cache.lookup("/cached/x", "id=1").await.unwrap();
        assert_eq!(hit.body, "{\"id\":1}");
        assert!(cache.lookup("/cached/x", "id=2").await.is_none());

        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
        assert!(cache.lookup("/cached/x", "id=1").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
    }

    #[tokio::test]
    async fn test_non_200_and_binary_not_stored() {
        let cache = cache(&[("/cached", 60)]);
        let ttl = Duration::seconds(60);
        assert!(!cache.store("/cached/a", "", 404, vec![], None, b"missing", ttl).await.unwrap());
        assert!(!cache.store("/cached/b", "", 200, vec![], None, &[0xff, 0xfe], ttl).await.unwrap());
        assert!(cache.lookup("/cached/a", "").await.is_none());
        assert!(cache.lookup("/cached/b", "").await.is_none());
    }

    #[tokio::test]
    async fn test_flush_by_pattern() {
        let cache = cache(&[("/api/products", 60), ("/blog", 60)]);
        let ttl = Duration::seconds(60);
        cache.store("/api/products/1", "", 200, vec![], None, b"a", ttl).await.unwrap();
        cache.store("/api/products/2", "", 200, vec![], None, b"b", ttl).await.unwrap();
        cache.store("/blog/post", "", 200, vec![], None, b"c", ttl).await.unwrap();

        assert_eq!(cache.flush("/api/products*").await.unwrap(), 2);
        assert!(cache.lookup("/api/products/1", "").await.is_none());
        assert!(cache.lookup("/blog/post", "").await.is_some());
    }
}
