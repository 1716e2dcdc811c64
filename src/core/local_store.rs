//! Process-local store used when Redis is unreachable.
//!
//! Best-effort and per-process: counters are sliding windows of hit
//! timestamps, values expire passively on read.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::utils::glob_match;
use super::store::{KvStore, StoreError};

struct LocalValue {
    value: String,
    expires_at: Option<Instant>,
}

impl LocalValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

struct HitWindow {
    span: Duration,
    hits: VecDeque<Instant>,
}

impl HitWindow {
    fn is_idle(&self, now: Instant) -> bool {
        self.hits
            .back()
            .map_or(true, |last| now.duration_since(*last) >= self.span)
    }
}

pub struct LocalStore {
    values: DashMap<String, LocalValue>,
    windows: DashMap<String, HitWindow>,
    collections: DashMap<String, Vec<(i64, String)>>,
    max_documents: usize,
}

impl LocalStore {
    pub fn new(max_documents: usize) -> Self {
        Self {
            values: DashMap::new(),
            windows: DashMap::new(),
            collections: DashMap::new(),
            max_documents: max_documents.max(1),
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl KvStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.values.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.values.remove_if(key, |_, v| !v.is_live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.values.insert(
            key.to_string(),
            LocalValue {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .values
            .iter()
            .filter(|e| e.value().is_live(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn hit(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| HitWindow {
            span: window,
            hits: VecDeque::new(),
        });
        entry.span = window;
        while let Some(front) = entry.hits.front() {
            if now.duration_since(*front) >= window {
                entry.hits.pop_front();
            } else {
                break;
            }
        }
        entry.hits.push_back(now);
        Ok(entry.hits.len() as u64)
    }

    async fn append(&self, collection: &str, score: i64, document: &str) -> Result<(), StoreError> {
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        let at = docs.partition_point(|(s, _)| *s <= score);
        docs.insert(at, (score, document.to_string()));
        if docs.len() > self.max_documents {
            let excess = docs.len() - self.max_documents;
            docs.drain(..excess);
        }
        Ok(())
    }

    async fn range(&self, collection: &str, min: i64, max: i64) -> Result<Vec<String>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(s, _)| *s >= min && *s <= max)
                    .map(|(_, d)| d.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn trim(&self, collection: &str, below: i64) -> Result<(), StoreError> {
        if let Some(mut docs) = self.collections.get_mut(collection) {
            docs.retain(|(s, _)| *s >= below);
        }
        Ok(())
    }

    fn purge_local(&self, prefixes: &[&str]) -> usize {
        let matches = |k: &str| prefixes.iter().any(|p| k.starts_with(p));
        let before = self.values.len() + self.windows.len();
        let now = Instant::now();
        self.values.retain(|k, v| v.is_live(now) && !matches(k));
        self.windows.retain(|k, _| !matches(k));
        self.values.shrink_to_fit();
        self.windows.shrink_to_fit();
        before.saturating_sub(self.values.len() + self.windows.len())
    }

    fn sweep_expired(&self) -> usize {
        let before = self.values.len() + self.windows.len();
        let now = Instant::now();
        self.values.retain(|_, v| v.is_live(now));
        self.windows.retain(|_, w| !w.is_idle(now));
        before.saturating_sub(self.values.len() + self.windows.len())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_expire_passively() {
        let store = LocalStore::default();
        store.set("a", "1", Some(Duration::from_millis(50))).await.unwrap();
        store.set("b", "2", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.keys("*").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_hit_counts_sliding_window() {
        let store = LocalStore::default();
        let window = Duration::from_millis(100);
        assert_eq!(store.hit("ip", window).await.unwrap(), 1);
        assert_eq!(store.hit("ip", window).await.unwrap(), 2);
        assert_eq!(store.hit("other", window).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.hit("ip", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collections_are_ordered_and_bounded() {
        let store = LocalStore::new(3);
        store.append("events", 30, "c").await.unwrap();
        store.append("events", 10, "a").await.unwrap();
        store.append("events", 20, "b").await.unwrap();
        assert_eq!(store.range("events", 0, 100).await.unwrap(), vec!["a", "b", "c"]);

        store.append("events", 40, "d").await.unwrap();
        assert_eq!(store.range("events", 0, 100).await.unwrap(), vec!["b", "c", "d"]);
        assert_eq!(store.range("events", 25, 35).await.unwrap(), vec!["c"]);

        store.trim("events", 35).await.unwrap();
        assert_eq!(store.range("events", 0, 100).await.unwrap(), vec!["d"]);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_values_and_idle_windows() {
        let store = LocalStore::default();
        let short = Duration::from_millis(20);
        for i in 0..500 {
            store.set(&format!("blocklist:10.0.{}.{}", i / 256, i % 256), "x", Some(short)).await.unwrap();
            store.hit(&format!("rate_limit:{}", i), short).await.unwrap();
        }
        store.set("blocklist:203.0.113.9", "permanent", None).await.unwrap();
        store.hit("rate_limit:busy", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.sweep_expired(), 1000);
        assert_eq!(store.values.len(), 1);
        assert_eq!(store.windows.len(), 1);
        assert_eq!(store.sweep_expired(), 0);
    }

    #[tokio::test]
    async fn test_purge_local_only_touches_prefixes() {
        let store = LocalStore::default();
        store.set("cache:1", "x", None).await.unwrap();
        store.set("blocklist:1.2.3.4", "y", None).await.unwrap();
        store.hit("rate_limit:a", Duration::from_secs(60)).await.unwrap();

        let released = store.purge_local(&["cache:", "rate_limit:"]);
        assert_eq!(released, 2);
        assert!(store.get("cache:1").await.unwrap().is_none());
        assert!(store.get("blocklist:1.2.3.4").await.unwrap().is_some());
    }
}
