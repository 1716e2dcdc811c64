//! Registry of blocked client identities.
//!
//! The persistent copy lives in the backing store under `blocklist:{ip}` so
//! every replica sees it; a read-through in-process cache answers repeat
//! lookups without a store round trip.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::utils::format_rate_limit_key;
use super::store::{KvStore, StoreError};

const PREFIX: &str = "blocklist";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub identity: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    /// `None` for permanent entries
    pub expires_at: Option<DateTime<Utc>>,
    /// Created by automated mitigation rather than an operator
    pub auto: bool,
}

impl BlockEntry {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Created,
    Extended,
    /// An entry lasting at least as long was already in place
    Unchanged,
}

pub struct BlocklistStore {
    store: Arc<dyn KvStore>,
    cache: DashMap<String, BlockEntry>,
}

impl BlocklistStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Install configured permanent entries.
    pub async fn load_permanent(&self, identities: &[String]) -> Result<(), StoreError> {
        for identity in identities {
            self.block_permanent(identity, "configured deny-list").await?;
        }
        Ok(())
    }

    /// Block `identity` for `ttl`, keeping whichever of the existing and new expiry is later.
    pub async fn block(
        &self,
        identity: &str,
        reason: &str,
        ttl: Duration,
        auto: bool,
    ) -> Result<BlockOutcome, StoreError> {
        let now = Utc::now();
        let expires_at = now.checked_add_signed(ttl).ok_or(StoreError::ExpiryOutOfRange)?;
        let existing = self.lookup(identity).await?.filter(|e| e.is_active_at(now));

        let outcome = match &existing {
            Some(entry) if entry.expires_at.map_or(true, |at| at >= expires_at) => {
                return Ok(BlockOutcome::Unchanged);
            }
            Some(_) => BlockOutcome::Extended,
            None => BlockOutcome::Created,
        };

        let entry = BlockEntry {
            identity: identity.to_string(),
            reason: reason.to_string(),
            blocked_at: existing.map_or(now, |e| e.blocked_at),
            expires_at: Some(expires_at),
            auto,
        };
        self.persist(&entry).await?;
        info!("Blocked {} until {} ({})", identity, expires_at, reason);
        Ok(outcome)
    }

    /// Operator action; a permanent entry outranks any temporary one.
    pub async fn block_permanent(&self, identity: &str, reason: &str) -> Result<BlockOutcome, StoreError> {
        let existing = self.lookup(identity).await?;
        if existing.as_ref().map_or(false, BlockEntry::is_permanent) {
            return Ok(BlockOutcome::Unchanged);
        }
        let entry = BlockEntry {
            identity: identity.to_string(),
            reason: reason.to_string(),
            blocked_at: Utc::now(),
            expires_at: None,
            auto: false,
        };
        self.persist(&entry).await?;
        info!("Permanently blocked {} ({})", identity, reason);
        Ok(if existing.is_some() {
            BlockOutcome::Extended
        } else {
            BlockOutcome::Created
        })
    }

    pub async fn unblock(&self, identity: &str) -> Result<bool, StoreError> {
        let cached = self.cache.remove(identity).is_some();
        let stored = self.lookup(identity).await?.is_some();
        self.store.delete(&key(identity)).await?;
        let was_blocked = cached || stored;
        if was_blocked {
            info!("Unblocked {}", identity);
        }
        Ok(was_blocked)
    }

    /// Fast path: in-process cache, then the persistent copy (entries written by other replicas).
    pub async fn is_blocked(&self, identity: &str) -> bool {
        let now = Utc::now();
        if let Some(entry) = self.cache.get(identity) {
            if entry.is_active_at(now) {
                return true;
            }
        }
        self.cache.remove_if(identity, |_, e| !e.is_active_at(now));

        match self.lookup(identity).await {
            Ok(Some(entry)) if entry.is_active_at(now) => {
                self.cache.insert(identity.to_string(), entry);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Blocklist lookup for {} failed: {}", identity, e);
                false
            }
        }
    }

    pub async fn get(&self, identity: &str) -> Result<Option<BlockEntry>, StoreError> {
        Ok(self.lookup(identity).await?.filter(|e| e.is_active_at(Utc::now())))
    }

    /// Active entries known to the persistent store.
    pub async fn list(&self) -> Result<Vec<BlockEntry>, StoreError> {
        let now = Utc::now();
        let mut entries = Vec::new();
        for k in self.store.keys(&format!("{}:*", PREFIX)).await? {
            if let Some(entry) = self.read(&k).await? {
                if entry.is_active_at(now) {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(entries)
    }

    pub async fn active_count(&self) -> Result<usize, StoreError> {
        Ok(self.list().await?.len())
    }

    /// Purge expired entries from both the persistent store and the in-process cache.
    ///
    /// Also sweeps every expired value and idle counter out of the process-local
    /// tier; Redis expires its own keys.
    pub async fn cleanup(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let before = self.cache.len();
        self.cache.retain(|_, e| e.is_active_at(now));
        let mut purged = before - self.cache.len();

        let swept = self.store.sweep_expired();
        if swept > 0 {
            debug!("Swept {} expired local store entries", swept);
        }

        for k in self.store.keys(&format!("{}:*", PREFIX)).await? {
            match self.read(&k).await? {
                Some(entry) if entry.is_active_at(now) => {}
                Some(_) => {
                    self.store.delete(&k).await?;
                    purged += 1;
                }
                None => {}
            }
        }
        if purged > 0 {
            info!("Blocklist cleanup purged {} expired entries", purged);
        }
        Ok(purged)
    }

    async fn lookup(&self, identity: &str) -> Result<Option<BlockEntry>, StoreError> {
        self.read(&key(identity)).await
    }

    async fn read(&self, key: &str) -> Result<Option<BlockEntry>, StoreError> {
        match self.store.get(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn persist(&self, entry: &BlockEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(entry)?;
        let ttl = entry
            .expires_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or_default());
        self.store.set(&key(&entry.identity), &json, ttl).await?;
        self.cache.insert(entry.identity.clone(), entry.clone());
        Ok(())
    }
}

fn key(identity: &str) -> String {
    format_rate_limit_key(PREFIX, identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::local_store::LocalStore;

    fn blocklist() -> BlocklistStore {
        BlocklistStore::new(Arc::new(LocalStore::default()))
    }

    #[tokio::test]
    async fn test_block_keeps_longer_expiry() {
        let bl = blocklist();
        assert_eq!(
            bl.block("10.0.0.1", "rate", Duration::minutes(15), true).await.unwrap(),
            BlockOutcome::Created
        );
        let first = bl.get("10.0.0.1").await.unwrap().unwrap();

        assert_eq!(
            bl.block("10.0.0.1", "shorter", Duration::minutes(1), true).await.unwrap(),
            BlockOutcome::Unchanged
        );
        assert_eq!(bl.get("10.0.0.1").await.unwrap().unwrap(), first);

        assert_eq!(
            bl.block("10.0.0.1", "brute force", Duration::hours(24), true).await.unwrap(),
            BlockOutcome::Extended
        );
        let extended = bl.get("10.0.0.1").await.unwrap().unwrap();
        assert!(extended.expires_at > first.expires_at);
        assert_eq!(extended.blocked_at, first.blocked_at);
        assert_eq!(bl.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_block_expires_and_cleanup_purges() {
        let store: Arc<dyn KvStore> = Arc::new(LocalStore::default());
        let bl = BlocklistStore::new(store.clone());
        bl.block("10.0.0.2", "rate", Duration::milliseconds(1200), true).await.unwrap();
        assert!(bl.is_blocked("10.0.0.2").await);

        tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
        assert!(!bl.is_blocked("10.0.0.2").await);

        bl.cleanup().await.unwrap();
        assert!(store.keys("blocklist:*").await.unwrap().is_empty());
        assert!(bl.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_releases_expired_local_state() {
        let store: Arc<dyn KvStore> = Arc::new(LocalStore::default());
        let untouched: Arc<dyn KvStore> = Arc::new(LocalStore::default());
        let bl = BlocklistStore::new(store.clone());
        let other = BlocklistStore::new(untouched.clone());
        let window = std::time::Duration::from_millis(20);
        for i in 0..50 {
            let ip = format!("10.20.0.{}", i);
            bl.block(&ip, "rate", Duration::milliseconds(20), true).await.unwrap();
            other.block(&ip, "rate", Duration::milliseconds(20), true).await.unwrap();
            store.hit(&format!("rate_limit:{}", ip), window).await.unwrap();
            untouched.hit(&format!("rate_limit:{}", ip), window).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        assert_eq!(bl.cleanup().await.unwrap(), 50);
        assert_eq!(store.sweep_expired(), 0);
        assert_eq!(untouched.sweep_expired(), 100);
    }

    #[tokio::test]
    async fn test_block_rejects_unrepresentable_expiry() {
        let bl = blocklist();
        let result = bl.block("10.0.0.4", "huge", Duration::days(365_000_000), false).await;
        assert!(matches!(result, Err(StoreError::ExpiryOutOfRange)));
        assert!(!bl.is_blocked("10.0.0.4").await);
    }

    #[tokio::test]
    async fn test_entries_from_another_replica_are_seen() {
        let store: Arc<dyn KvStore> = Arc::new(LocalStore::default());
        let writer = BlocklistStore::new(store.clone());
        let reader = BlocklistStore::new(store);

        assert!(!reader.is_blocked("10.0.0.3").await);
        writer.block("10.0.0.3", "payload", Duration::hours(1), true).await.unwrap();
        assert!(reader.is_blocked("10.0.0.3").await);
    }

    #[tokio::test]
    async fn test_permanent_entries_win() {
        let bl = blocklist();
        bl.load_permanent(&["203.0.113.9".to_string()]).await.unwrap();
        assert!(bl.is_blocked("203.0.113.9").await);

        assert_eq!(
            bl.block("203.0.113.9", "rate", Duration::minutes(15), true).await.unwrap(),
            BlockOutcome::Unchanged
        );
        bl.cleanup().await.unwrap();
        assert!(bl.get("203.0.113.9").await.unwrap().unwrap().is_permanent());

        assert!(bl.unblock("203.0.113.9").await.unwrap());
        assert!(!bl.is_blocked("203.0.113.9").await);
    }
}
