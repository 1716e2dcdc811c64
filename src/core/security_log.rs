//! Durable ledger of security signals.
//!
//! Threat events and audit reports are kept permanently; failed logins,
//! payload samples and slow requests are working data trimmed after a day.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::store::{KvStore, StoreError};
use super::threat::ThreatEvent;

pub const THREAT_EVENTS: &str = "threat_events";
pub const AUDIT_REPORTS: &str = "audit_reports";
pub const ALERTS: &str = "alerts";
pub const FAILED_LOGINS: &str = "failed_logins";
pub const REQUEST_PAYLOADS: &str = "request_payloads";
pub const SLOW_REQUESTS: &str = "slow_requests";

const TRANSIENT: [&str; 3] = [FAILED_LOGINS, REQUEST_PAYLOADS, SLOW_REQUESTS];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedLogin {
    pub identity: String,
    pub username: Option<String>,
    pub endpoint: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadRecord {
    pub identity: String,
    pub endpoint: String,
    pub payload: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowRequest {
    pub identity: String,
    pub method: String,
    pub path: String,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

pub struct SecurityLog {
    store: Arc<dyn KvStore>,
}

impl SecurityLog {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn append<T: Serialize>(
        &self,
        collection: &str,
        at: DateTime<Utc>,
        document: &T,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(document)?;
        self.store.append(collection, at.timestamp_millis(), &json).await
    }

    /// Documents recorded in `[from, to]`. Undecodable entries are skipped.
    pub async fn between<T: DeserializeOwned>(
        &self,
        collection: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<T>, StoreError> {
        let docs = self
            .store
            .range(collection, from.timestamp_millis(), to.timestamp_millis())
            .await?;
        Ok(docs
            .iter()
            .filter_map(|d| match serde_json::from_str(d) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!("Skipping malformed {} document: {}", collection, e);
                    None
                }
            })
            .collect())
    }

    pub async fn since<T: DeserializeOwned>(
        &self,
        collection: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<T>, StoreError> {
        self.between(collection, since, Utc::now()).await
    }

    pub async fn record_failed_login(
        &self,
        identity: &str,
        username: Option<String>,
        endpoint: &str,
    ) -> Result<(), StoreError> {
        let record = FailedLogin {
            identity: identity.to_string(),
            username,
            endpoint: endpoint.to_string(),
            at: Utc::now(),
        };
        self.append(FAILED_LOGINS, record.at, &record).await
    }

    pub async fn failed_logins_since(&self, since: DateTime<Utc>) -> Result<Vec<FailedLogin>, StoreError> {
        self.since(FAILED_LOGINS, since).await
    }

    pub async fn record_payload(&self, identity: &str, endpoint: &str, payload: &str) -> Result<(), StoreError> {
        let record = PayloadRecord {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
            payload: payload.to_string(),
            at: Utc::now(),
        };
        self.append(REQUEST_PAYLOADS, record.at, &record).await
    }

    pub async fn record_slow_request(&self, record: &SlowRequest) -> Result<(), StoreError> {
        self.append(SLOW_REQUESTS, record.at, record).await
    }

    pub async fn record_threat(&self, event: &ThreatEvent) -> Result<(), StoreError> {
        self.append(THREAT_EVENTS, event.detected_at, event).await
    }

    pub async fn threats_since(&self, since: DateTime<Utc>) -> Result<Vec<ThreatEvent>, StoreError> {
        self.since(THREAT_EVENTS, since).await
    }

    /// Drop working data older than `retention`; permanent collections are untouched.
    pub async fn trim_transient(&self, retention: Duration) -> Result<(), StoreError> {
        let cutoff = (Utc::now() - retention).timestamp_millis();
        for collection in TRANSIENT {
            self.store.trim(collection, cutoff).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::local_store::LocalStore;
    use crate::core::threat::{Severity, ThreatType};

    fn log() -> SecurityLog {
        SecurityLog::new(Arc::new(LocalStore::default()))
    }

    #[tokio::test]
    async fn test_failed_logins_window() {
        let log = log();
        log.record_failed_login("10.0.0.1", Some("alice".into()), "/login").await.unwrap();
        log.record_failed_login("10.0.0.2", None, "/login").await.unwrap();

        let recent = log.failed_logins_since(Utc::now() - Duration::minutes(15)).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].identity, "10.0.0.1");

        let future = log.failed_logins_since(Utc::now() + Duration::minutes(1)).await.unwrap();
        assert!(future.is_empty());
    }

    #[tokio::test]
    async fn test_trim_keeps_threat_events() {
        let log = log();
        let event = ThreatEvent::new(ThreatType::BruteForce, Severity::Critical, "10.0.0.1", "x");
        log.record_threat(&event).await.unwrap();
        log.record_payload("10.0.0.1", "/contact", "hello").await.unwrap();

        log.trim_transient(Duration::minutes(-1)).await.unwrap();

        let payloads: Vec<PayloadRecord> = log
            .since(REQUEST_PAYLOADS, Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert!(payloads.is_empty());
        let threats = log.threats_since(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].id, event.id);
    }
}
