//! Threat monitor for the traffic guard.
//!
//! Runs on its own timeline, separate from request handling. Every cycle it
//! purges expired blocks, then scans logs, failed logins, recorded payloads,
//! host resources and dependent services, and queues a [`ThreatEvent`] for
//! the mitigation engine for each finding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::models::MonitoringConfig;
use crate::utils::tail_lines;
use super::blocklist::BlocklistStore;
use super::patterns::PatternSet;
use super::resources::ResourceSampler;
use super::security_log::{PayloadRecord, SecurityLog, REQUEST_PAYLOADS};
use super::shutdown::Shutdown;
use super::supervisor::ServiceSupervisor;
use super::threat::{Severity, ThreatEvent, ThreatType};

/// Working data older than this is trimmed from the security log.
const TRANSIENT_RETENTION_HOURS: i64 = 24;

/// One request line from a combined-format access log.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessLine {
    pub identity: String,
    pub target: String,
    pub status: u16,
}

/// Parse `ip - user [time] "METHOD /target HTTP/x" status ...`.
pub fn parse_access_line(line: &str) -> Option<AccessLine> {
    let identity = line.split_whitespace().next()?;
    let open = line.find('"')?;
    let close = open + 1 + line[open + 1..].find('"')?;
    let mut request = line[open + 1..close].split_whitespace();
    let target = request.nth(1)?;
    let status = line[close + 1..].split_whitespace().next()?.parse().ok()?;
    Some(AccessLine {
        identity: identity.to_string(),
        target: target.to_string(),
        status,
    })
}

/// Client address from an nginx error log line (`..., client: 1.2.3.4, server: ...`).
fn error_line_client(line: &str) -> Option<&str> {
    let start = line.find("client: ")? + "client: ".len();
    line[start..]
        .split(|c: char| c == ',' || c.is_whitespace())
        .next()
        .filter(|ip| !ip.is_empty())
}

fn split_target(target: &str) -> (&str, &str) {
    target.split_once('?').unwrap_or((target, ""))
}

pub struct ThreatMonitor {
    config: MonitoringConfig,
    patterns: Arc<PatternSet>,
    blocklist: Arc<BlocklistStore>,
    log: Arc<SecurityLog>,
    sampler: Arc<dyn ResourceSampler>,
    supervisor: Arc<dyn ServiceSupervisor>,
    events: mpsc::Sender<ThreatEvent>,
    /// Last emission time per (type, source)
    recent: DashMap<(ThreatType, String), DateTime<Utc>>,
    payload_watermark: Mutex<DateTime<Utc>>,
}

impl ThreatMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MonitoringConfig,
        patterns: Arc<PatternSet>,
        blocklist: Arc<BlocklistStore>,
        log: Arc<SecurityLog>,
        sampler: Arc<dyn ResourceSampler>,
        supervisor: Arc<dyn ServiceSupervisor>,
        events: mpsc::Sender<ThreatEvent>,
    ) -> Self {
        let watermark = Utc::now() - Duration::minutes(config.failed_login_window_minutes);
        Self {
            config,
            patterns,
            blocklist,
            log,
            sampler,
            supervisor,
            events,
            recent: DashMap::new(),
            payload_watermark: Mutex::new(watermark),
        }
    }

    /// Run cycles until shutdown. A cycle with any failed check is followed by
    /// the longer backoff pause instead of the normal interval.
    pub async fn run(&self, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();
        let interval = StdDuration::from_secs(self.config.interval_seconds);
        let backoff = StdDuration::from_secs(self.config.backoff_seconds);
        info!("Starting threat monitor (every {:?})", interval);

        loop {
            let pause = if self.run_cycle().await { interval } else { backoff };
            tokio::select! {
                _ = stop.recv() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("Threat monitor stopped");
    }

    /// One full pass. Returns false when any step failed; the others still ran.
    pub async fn run_cycle(&self) -> bool {
        let mut healthy = true;

        match self.blocklist.cleanup().await {
            Ok(0) => {}
            Ok(n) => info!("Removed {} expired block entries", n),
            Err(e) => {
                error!("Blocklist cleanup failed: {}", e);
                healthy = false;
            }
        }
        if let Err(e) = self
            .log
            .trim_transient(Duration::hours(TRANSIENT_RETENTION_HOURS))
            .await
        {
            error!("Trimming security log failed: {}", e);
            healthy = false;
        }
        self.forget_stale();

        let results = vec![
            ("log scan", self.scan_logs().await),
            ("failed logins", self.check_failed_logins().await),
            ("payloads", self.scan_payloads().await),
            ("resources", self.sample_resources().await),
            ("services", self.check_services().await),
        ];

        let mut emitted = 0;
        for (check, result) in results {
            match result {
                Ok(n) => emitted += n,
                Err(e) => {
                    error!("Monitor check '{}' failed: {:#}", check, e);
                    healthy = false;
                }
            }
        }
        debug!("Monitor cycle finished: {} events, healthy={}", emitted, healthy);
        healthy
    }

    /// Tail each log source: repeated 404s on probe paths and signature hits.
    pub async fn scan_logs(&self) -> Result<usize> {
        let mut not_found: HashMap<String, usize> = HashMap::new();
        let mut hits: HashMap<String, String> = HashMap::new();
        let mut failed = Vec::new();

        for source in &self.config.log_sources {
            let lines = match tail_lines(source, self.config.tail_lines).await {
                Ok(lines) => lines,
                Err(e) => {
                    warn!("Cannot read log source {}: {}", source, e);
                    failed.push(source.as_str());
                    continue;
                }
            };

            for line in &lines {
                if let Some(access) = parse_access_line(line) {
                    let (path, query) = split_target(&access.target);
                    if access.status == 404 && self.is_probe_path(path) {
                        *not_found.entry(access.identity.clone()).or_insert(0) += 1;
                    }
                    if self.patterns.is_suspicious_request(path, query) {
                        hits.entry(access.identity).or_insert_with(|| access.target.clone());
                    }
                } else if let Some(client) = error_line_client(line) {
                    if self.patterns.is_suspicious(line) {
                        hits.entry(client.to_string()).or_insert_with(|| line.clone());
                    }
                }
            }
        }

        let mut emitted = 0;
        let threshold = self.config.scan_404_threshold.max(1);
        for (identity, count) in not_found {
            if count < threshold {
                continue;
            }
            let severity = if count >= threshold * 2 {
                Severity::High
            } else {
                Severity::Medium
            };
            let event = ThreatEvent::new(
                ThreatType::VulnerabilityScan,
                severity,
                identity,
                format!("{} not-found responses on probe paths", count),
            );
            if self.emit(event).await? {
                emitted += 1;
            }
        }
        for (identity, excerpt) in hits {
            if self.blocklist.is_blocked(&identity).await {
                continue;
            }
            let event = ThreatEvent::new(
                ThreatType::MaliciousPayload,
                Severity::High,
                identity,
                "Attack signature in server log",
            )
            .with_payload(&excerpt);
            if self.emit(event).await? {
                emitted += 1;
            }
        }

        if failed.is_empty() {
            Ok(emitted)
        } else {
            Err(anyhow!("unreadable log sources: {}", failed.join(", ")))
        }
    }

    fn is_probe_path(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        self.config
            .scan_paths
            .iter()
            .any(|probe| path.starts_with(&probe.to_ascii_lowercase()))
    }

    /// Failed logins per identity over the trailing window.
    pub async fn check_failed_logins(&self) -> Result<usize> {
        let since = Utc::now() - Duration::minutes(self.config.failed_login_window_minutes);
        let attempts = self
            .log
            .failed_logins_since(since)
            .await
            .context("reading failed logins")?;

        let mut by_identity: HashMap<String, (usize, String)> = HashMap::new();
        for attempt in attempts {
            let entry = by_identity.entry(attempt.identity).or_insert((0, String::new()));
            entry.0 += 1;
            entry.1 = attempt.endpoint;
        }

        let mut emitted = 0;
        for (identity, (count, endpoint)) in by_identity {
            if count < self.config.failed_login_threshold || identity == "unknown" {
                continue;
            }
            if self.blocklist.is_blocked(&identity).await {
                continue;
            }
            let event = ThreatEvent::new(
                ThreatType::BruteForce,
                Severity::Critical,
                identity,
                format!(
                    "{} failed logins in {} minutes",
                    count, self.config.failed_login_window_minutes
                ),
            )
            .with_endpoint(endpoint);
            if self.emit(event).await? {
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    /// Payload samples recorded since the previous pass.
    pub async fn scan_payloads(&self) -> Result<usize> {
        let from = self
            .payload_watermark
            .lock()
            .map(|w| *w + Duration::milliseconds(1))
            .map_err(|_| anyhow!("payload watermark lock poisoned"))?;
        let records: Vec<PayloadRecord> = self
            .log
            .between(REQUEST_PAYLOADS, from, Utc::now())
            .await
            .context("reading payload records")?;

        if let Some(latest) = records.iter().map(|r| r.at).max() {
            if let Ok(mut watermark) = self.payload_watermark.lock() {
                *watermark = latest;
            }
        }

        let mut emitted = 0;
        for record in records {
            let (path, query) = split_target(&record.endpoint);
            if !self.patterns.is_suspicious(&record.payload)
                && !self.patterns.is_suspicious_request(path, query)
            {
                continue;
            }
            if self.blocklist.is_blocked(&record.identity).await {
                continue;
            }
            let event = ThreatEvent::new(
                ThreatType::MaliciousPayload,
                Severity::High,
                record.identity.clone(),
                "Attack signature in request payload",
            )
            .with_endpoint(record.endpoint.clone())
            .with_payload(&record.payload);
            if self.emit(event).await? {
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    /// Host resources and connection count.
    pub async fn sample_resources(&self) -> Result<usize> {
        let snapshot = self.sampler.sample().await.context("sampling resources")?;
        let limits = &self.config.alert_thresholds;
        metrics::gauge!("guard_cpu_usage_percent", snapshot.cpu_usage);
        metrics::gauge!("guard_memory_usage_percent", snapshot.memory_usage);
        metrics::gauge!("guard_disk_usage_percent", snapshot.disk_usage);
        metrics::gauge!("guard_connections", snapshot.connections as f64);

        let severity = if snapshot.cpu_usage >= limits.cpu_critical
            || snapshot.memory_usage >= limits.memory_critical
        {
            Some(Severity::High)
        } else if snapshot.cpu_usage >= limits.cpu_usage
            || snapshot.memory_usage >= limits.memory_usage
            || snapshot.disk_usage >= limits.disk_usage
        {
            Some(Severity::Medium)
        } else {
            None
        };

        let mut emitted = 0;
        if let Some(severity) = severity {
            let event = ThreatEvent::new(
                ThreatType::ResourceExhaustion,
                severity,
                "system",
                format!(
                    "cpu {:.1}%, memory {:.1}%, disk {:.1}%",
                    snapshot.cpu_usage, snapshot.memory_usage, snapshot.disk_usage
                ),
            );
            if self.emit(event).await? {
                emitted += 1;
            }
        }
        if snapshot.connections > limits.connections {
            let event = ThreatEvent::new(
                ThreatType::DdosAttempt,
                Severity::High,
                "system",
                format!("{} established connections", snapshot.connections),
            );
            if self.emit(event).await? {
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    /// Liveness of each dependent service through the supervisor.
    pub async fn check_services(&self) -> Result<usize> {
        let mut emitted = 0;
        let mut failed = Vec::new();
        for service in &self.config.services {
            match self.supervisor.is_running(service).await {
                Ok(true) => {}
                Ok(false) => {
                    let event = ThreatEvent::new(
                        ThreatType::ServiceFailure,
                        Severity::High,
                        service.clone(),
                        format!("service {} is not running", service),
                    );
                    if self.emit(event).await? {
                        emitted += 1;
                    }
                }
                Err(e) => {
                    warn!("Cannot query service {}: {}", service, e);
                    failed.push(service.as_str());
                }
            }
        }
        if failed.is_empty() {
            Ok(emitted)
        } else {
            Err(anyhow!("supervisor unreachable for: {}", failed.join(", ")))
        }
    }

    /// Queue an event unless the same (type, source) was emitted recently.
    async fn emit(&self, event: ThreatEvent) -> Result<bool> {
        let key = (event.threat_type, event.source.clone());
        let window = Duration::minutes(self.config.dedupe_minutes);
        if let Some(last) = self.recent.get(&key) {
            if event.detected_at - *last < window {
                return Ok(false);
            }
        }
        self.recent.insert(key, event.detected_at);

        warn!(
            "Detected {} ({}) from {}: {}",
            event.threat_type, event.severity, event.source, event.description
        );
        metrics::increment_counter!("guard_threats_detected_total", "type" => event.threat_type.as_str());
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("mitigation queue closed"))?;
        Ok(true)
    }

    fn forget_stale(&self) {
        let cutoff = Utc::now() - Duration::minutes(self.config.dedupe_minutes);
        self.recent.retain(|_, last| *last >= cutoff);
    }
}
