//! Threat events produced by the monitor and resolved by the mitigation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    BruteForce,
    MaliciousPayload,
    DdosAttempt,
    ResourceExhaustion,
    VulnerabilityScan,
    ServiceFailure,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::BruteForce => "brute_force",
            ThreatType::MaliciousPayload => "malicious_payload",
            ThreatType::DdosAttempt => "ddos_attempt",
            ThreatType::ResourceExhaustion => "resource_exhaustion",
            ThreatType::VulnerabilityScan => "vulnerability_scan",
            ThreatType::ServiceFailure => "service_failure",
        }
    }
}

impl std::fmt::Display for ThreatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Ordered by progress; an event never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatStatus {
    Detected,
    Mitigated,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub id: String,
    pub threat_type: ThreatType,
    pub severity: Severity,
    /// Client identity, service name, or `system` for host-level findings
    pub source: String,
    pub endpoint: Option<String>,
    pub payload: Option<String>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub status: ThreatStatus,
    pub auto_fixed: bool,
    pub mitigation_actions: Vec<String>,
}

/// Longest payload excerpt kept on an event.
const PAYLOAD_EXCERPT: usize = 500;

impl ThreatEvent {
    pub fn new(
        threat_type: ThreatType,
        severity: Severity,
        source: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            threat_type,
            severity,
            source: source.into(),
            endpoint: None,
            payload: None,
            description: description.into(),
            detected_at: Utc::now(),
            status: ThreatStatus::Detected,
            auto_fixed: false,
            mitigation_actions: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_payload(mut self, payload: &str) -> Self {
        self.payload = Some(payload.chars().take(PAYLOAD_EXCERPT).collect());
        self
    }

    /// Move to `status` unless that would regress. Returns whether the status changed.
    pub fn advance(&mut self, status: ThreatStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_never_regresses() {
        let mut event = ThreatEvent::new(ThreatType::BruteForce, Severity::Critical, "10.0.0.1", "x");
        assert_eq!(event.status, ThreatStatus::Detected);
        assert!(event.advance(ThreatStatus::Blocked));
        assert!(!event.advance(ThreatStatus::Mitigated));
        assert!(!event.advance(ThreatStatus::Detected));
        assert_eq!(event.status, ThreatStatus::Blocked);
    }

    #[test]
    fn test_serialized_names() {
        let event = ThreatEvent::new(ThreatType::DdosAttempt, Severity::High, "system", "conns")
            .with_payload(&"x".repeat(2000));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["threat_type"], "ddos_attempt");
        assert_eq!(json["severity"], "HIGH");
        assert_eq!(json["status"], "DETECTED");
        assert_eq!(event.payload.unwrap().len(), 500);
    }
}
