//! Key-value backing store shared by the rate limiter, the response cache,
//! the blocklist and the security log.
//!
//! One trait, three implementations: Redis, process-local, and a tiered
//! store that writes to both and reads from Redis with a local fallback.
//! Which one a process gets is decided once by [`connect`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;

use crate::models::RedisConfig;
use super::local_store::LocalStore;
use super::redis_store::RedisStore;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Expiry is out of range")]
    ExpiryOutOfRange,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite; `None` keeps the value until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys matching a glob pattern (`*`, `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Count one hit against `key` and return the hits inside the current window.
    async fn hit(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    /// Append a document to an ordered collection.
    async fn append(&self, collection: &str, score: i64, document: &str) -> Result<(), StoreError>;

    /// Documents with `min <= score <= max`, oldest first.
    async fn range(&self, collection: &str, min: i64, max: i64) -> Result<Vec<String>, StoreError>;

    /// Drop documents scored below `below`.
    async fn trim(&self, collection: &str, below: i64) -> Result<(), StoreError>;

    /// Drop process-local values and counters whose key starts with one of `prefixes`.
    /// Returns the number of entries released.
    fn purge_local(&self, _prefixes: &[&str]) -> usize {
        0
    }

    /// Drop process-local values past their expiry and counter windows with no
    /// hit inside their span. Returns the number of entries released.
    fn sweep_expired(&self) -> usize {
        0
    }

    async fn ping(&self) -> Result<(), StoreError>;

    fn backend(&self) -> &'static str;
}

/// Documents appended while the primary was failing, kept for replay.
const BACKLOG_LIMIT: usize = 10_000;

/// Redis primary with a process-local fallback.
pub struct TieredStore {
    primary: Box<dyn KvStore>,
    local: LocalStore,
    backlog: Mutex<Vec<(String, i64, String)>>,
}

impl TieredStore {
    pub fn new(primary: Box<dyn KvStore>, local: LocalStore) -> Self {
        Self {
            primary,
            local,
            backlog: Mutex::new(Vec::new()),
        }
    }

    fn defer(&self, collection: &str, score: i64, document: &str) {
        if let Ok(mut backlog) = self.backlog.lock() {
            if backlog.len() >= BACKLOG_LIMIT {
                backlog.remove(0);
            }
            backlog.push((collection.to_string(), score, document.to_string()));
        }
    }

    /// Push documents written during an outage to the primary once it answers again.
    async fn replay(&self) {
        let pending = match self.backlog.lock() {
            Ok(mut backlog) if !backlog.is_empty() => std::mem::take(&mut *backlog),
            _ => return,
        };
        let total = pending.len();
        let mut failed = Vec::new();
        for (collection, score, document) in pending {
            if !failed.is_empty() {
                failed.push((collection, score, document));
                continue;
            }
            if self.primary.append(&collection, score, &document).await.is_err() {
                failed.push((collection, score, document));
            }
        }
        if failed.len() < total {
            info!("Replayed {} documents to Redis", total - failed.len());
        }
        if !failed.is_empty() {
            if let Ok(mut backlog) = self.backlog.lock() {
                failed.append(&mut backlog);
                *backlog = failed;
            }
        }
    }

    fn degraded(&self, op: &str, err: &StoreError) {
        metrics::increment_counter!("guard_store_fallbacks_total", "op" => op.to_string());
        warn!("Redis {} failed, using local store: {}", op, err);
    }
}

#[async_trait]
impl KvStore for TieredStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.primary.get(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.degraded("get", &e);
                self.local.get(key).await
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        if let Err(e) = self.primary.set(key, value, ttl).await {
            self.degraded("set", &e);
        }
        self.local.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if let Err(e) = self.primary.delete(key).await {
            self.degraded("delete", &e);
        }
        self.local.delete(key).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        match self.primary.keys(pattern).await {
            Ok(keys) => Ok(keys),
            Err(e) => {
                self.degraded("keys", &e);
                self.local.keys(pattern).await
            }
        }
    }

    async fn hit(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        match self.primary.hit(key, window).await {
            Ok(count) => Ok(count),
            Err(e) => {
                self.degraded("hit", &e);
                self.local.hit(key, window).await
            }
        }
    }

    async fn append(&self, collection: &str, score: i64, document: &str) -> Result<(), StoreError> {
        self.replay().await;
        if let Err(e) = self.primary.append(collection, score, document).await {
            self.degraded("append", &e);
            self.defer(collection, score, document);
        }
        self.local.append(collection, score, document).await
    }

    async fn range(&self, collection: &str, min: i64, max: i64) -> Result<Vec<String>, StoreError> {
        self.replay().await;
        match self.primary.range(collection, min, max).await {
            Ok(docs) => Ok(docs),
            Err(e) => {
                self.degraded("range", &e);
                self.local.range(collection, min, max).await
            }
        }
    }

    async fn trim(&self, collection: &str, below: i64) -> Result<(), StoreError> {
        if let Err(e) = self.primary.trim(collection, below).await {
            self.degraded("trim", &e);
        }
        self.local.trim(collection, below).await
    }

    fn purge_local(&self, prefixes: &[&str]) -> usize {
        self.local.purge_local(prefixes)
    }

    fn sweep_expired(&self) -> usize {
        self.local.sweep_expired()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.primary.ping().await
    }

    fn backend(&self) -> &'static str {
        "redis+local"
    }
}

/// Probe Redis once and pick the store implementation for the process lifetime.
pub async fn connect(config: &RedisConfig) -> Arc<dyn KvStore> {
    let local = LocalStore::new(config.local_max_documents);
    let timeout = Duration::from_millis(config.timeout_ms);

    match RedisStore::connect(&config.url, timeout).await {
        Ok(primary) => match primary.ping().await {
            Ok(()) => {
                info!("Connected to Redis at {}", config.url);
                Arc::new(TieredStore::new(Box::new(primary), local))
            }
            Err(e) => {
                warn!("Redis ping failed ({}), running with local store only", e);
                Arc::new(local)
            }
        },
        Err(e) => {
            warn!("Redis unavailable ({}), running with local store only", e);
            Arc::new(local)
        }
    }
}
