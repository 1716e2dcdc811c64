//! Alert records raised by the mitigation engine.
//!
//! Every alert is persisted to the `alerts` collection; when a webhook is
//! configured it is also posted there as JSON.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::AlertsConfig;
use super::security_log::{SecurityLog, ALERTS};
use super::store::StoreError;
use super::threat::{Severity, ThreatEvent};

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Webhook request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Alert could not be stored: {0}")]
    StoreError(#[from] StoreError),
}

/// Alert level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertLevel {
    /// Info alert
    Info,
    /// Warning alert
    Warning,
    /// Error alert
    Error,
    /// Critical alert
    Critical,
}

impl From<Severity> for AlertLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => AlertLevel::Info,
            Severity::Medium => AlertLevel::Warning,
            Severity::High => AlertLevel::Error,
            Severity::Critical => AlertLevel::Critical,
        }
    }
}

/// Alert status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

/// Alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Alert ID
    pub id: String,
    /// Alert level
    pub level: AlertLevel,
    /// Alert message
    pub message: String,
    /// Alert source
    pub source: String,
    /// Threat event this alert was raised for
    pub event_id: Option<String>,
    /// Alert status
    pub status: AlertStatus,
    /// Alert creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn for_event(event: &ThreatEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            level: event.severity.into(),
            message: format!(
                "{} {} from {}: {}",
                event.severity, event.threat_type, event.source, event.description
            ),
            source: event.threat_type.to_string(),
            event_id: Some(event.id.clone()),
            status: AlertStatus::Active,
            created_at: Utc::now(),
        }
    }
}

pub struct Alerter {
    log: Arc<SecurityLog>,
    client: Client,
    webhook_url: Option<String>,
    timeout: Duration,
}

impl Alerter {
    pub fn new(log: Arc<SecurityLog>, config: &AlertsConfig) -> Self {
        Self {
            log,
            client: Client::new(),
            webhook_url: config.webhook_url.clone(),
            timeout: Duration::from_millis(config.webhook_timeout_ms),
        }
    }

    /// Persist the alert, then deliver it to the webhook if one is configured.
    /// Delivery failures are logged; the stored record is what counts.
    pub async fn raise(&self, alert: &Alert) -> Result<(), AlertError> {
        warn!("ALERT [{:?}] {}", alert.level, alert.message);
        self.log.append(ALERTS, alert.created_at, alert).await?;

        if let Some(url) = &self.webhook_url {
            if let Err(e) = self.deliver(url, alert).await {
                error!("Alert webhook delivery failed: {}", e);
            }
        }
        Ok(())
    }

    async fn deliver(&self, url: &str, alert: &Alert) -> Result<(), AlertError> {
        self.client
            .post(url)
            .timeout(self.timeout)
            .json(alert)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::local_store::LocalStore;
    use crate::core::threat::ThreatType;

    #[tokio::test]
    async fn test_raise_persists_alert() {
        let log = Arc::new(SecurityLog::new(Arc::new(LocalStore::default())));
        let alerter = Alerter::new(log.clone(), &AlertsConfig::default());
        let event = ThreatEvent::new(ThreatType::BruteForce, Severity::Critical, "10.0.0.1", "12 failed logins");

        alerter.raise(&Alert::for_event(&event)).await.unwrap();

        let alerts: Vec<Alert> = log.since(ALERTS, Utc::now() - chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].event_id.as_deref(), Some(event.id.as_str()));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_fail_raise() {
        let log = Arc::new(SecurityLog::new(Arc::new(LocalStore::default())));
        let alerter = Alerter::new(
            log,
            &AlertsConfig {
                webhook_url: Some("http://127.0.0.1:1/hook".to_string()),
                webhook_timeout_ms: 200,
            },
        );
        let event = ThreatEvent::new(ThreatType::DdosAttempt, Severity::Critical, "system", "conns");
        assert!(alerter.raise(&Alert::for_event(&event)).await.is_ok());
    }
}
