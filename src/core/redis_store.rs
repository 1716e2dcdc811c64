//! Redis-backed store.
//!
//! Counters use fixed windows (`INCR` + `EXPIRE` on a bucketed key), document
//! collections are sorted sets scored by timestamp. Every call is bounded by
//! the configured timeout.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::utils::{format_rate_limit_key, get_current_timestamp};
use super::store::{KvStore, StoreError};

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Open a managed connection; fails if Redis does not answer within `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(timeout.max(Duration::from_millis(500)), ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;
        Ok(Self { conn, timeout })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            match ttl {
                Some(ttl) => conn.set_ex(key, value, ttl.as_secs().max(1) as usize).await,
                None => conn.set(key, value).await,
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.del(key).await }).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok(keys)
        })
        .await
    }

    async fn hit(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let window_secs = window.as_secs().max(1);
        let bucket = get_current_timestamp() / window_secs;
        let window_key = format_rate_limit_key(key, &bucket.to_string());
        let mut conn = self.conn.clone();

        self.bounded(async move {
            let count: u64 = conn.incr(&window_key, 1).await?;
            if count == 1 {
                let _: () = conn.expire(&window_key, window_secs as usize).await?;
            }
            Ok(count)
        })
        .await
    }

    async fn append(&self, collection: &str, score: i64, document: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.zadd(collection, document, score).await }).await
    }

    async fn range(&self, collection: &str, min: i64, max: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.zrangebyscore(collection, min, max).await }).await
    }

    async fn trim(&self, collection: &str, below: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(collection)
                .arg("-inf")
                .arg(format!("({}", below))
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
