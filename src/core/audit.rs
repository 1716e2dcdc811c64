//! Daily security and performance audit.
//!
//! Once a day, at a fixed local time, the scheduler rolls up the last 24
//! hours of threat events, failed logins and slow requests, checks the host
//! and the dependent services, scans error logs against a small bug
//! catalog, applies the matching remedies and stores a scored report.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDateTime, NaiveTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::AuditConfig;
use crate::utils::tail_lines;
use super::blocklist::BlocklistStore;
use super::cache::ResponseCache;
use super::rate_limiter::RateLimiter;
use super::resources::{ResourceSampler, ResourceSnapshot};
use super::security_log::{SecurityLog, SlowRequest, AUDIT_REPORTS, SLOW_REQUESTS};
use super::shutdown::Shutdown;
use super::supervisor::ServiceSupervisor;
use super::threat::{Severity, ThreatStatus, ThreatType};

const DEFAULT_RUN_AT: (u32, u32) = (2, 0);
const FIX_BONUS: u32 = 2;
const MAX_FIX_BONUS: u32 = 10;

/// Lines carrying these are HIGH severity bugs.
const FATAL_SIGNATURES: [&str; 4] = ["panic", "fatal", "out of memory", "cannot allocate memory"];
/// Lines carrying these are MEDIUM severity bugs.
const ERROR_SIGNATURES: [&str; 4] = ["error", "exception", "traceback", "segfault"];
/// Errors a cache and counter clear can relieve.
const EXHAUSTION_SIGNATURES: [&str; 5] = [
    "out of memory",
    "cannot allocate memory",
    "too many open files",
    "no space left on device",
    "resource temporarily unavailable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BugKind {
    ServiceDown,
    LogError,
    SlowResponses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bug {
    pub kind: BugKind,
    pub severity: Severity,
    /// Service name or log file
    pub source: String,
    pub detail: String,
    pub occurrences: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugFix {
    pub kind: BugKind,
    pub target: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityIssue {
    pub event_id: String,
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub source: String,
    pub status: ThreatStatus,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    pub restarted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySummary {
    pub blocked_identities: usize,
    pub failed_logins: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub unmitigated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub resources: ResourceSnapshot,
    pub slow_requests: usize,
    pub services: Vec<ServiceStatus>,
}

/// Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub id: String,
    pub date: DateTime<Utc>,
    pub summary: SecuritySummary,
    pub security_issues: Vec<SecurityIssue>,
    pub performance_metrics: PerformanceMetrics,
    pub bugs_detected: Vec<Bug>,
    pub bugs_fixed: Vec<BugFix>,
    pub recommendations: Vec<String>,
    pub score: u32,
}

/// Latest report plus live counters.
#[derive(Debug, Clone, Serialize)]
pub struct AuditOverview {
    pub latest: Option<AuditReport>,
    pub live: SecuritySummary,
    pub throttled: bool,
    pub generated_at: DateTime<Utc>,
}

/// Score a day: 100, minus 15 per HIGH (or CRITICAL) issue and 5 per MEDIUM,
/// minus 20/10 for CPU and memory over 90%/80%, minus 10 per HIGH bug, plus
/// 2 per fix up to 10. Clamped to 0..=100.
pub fn compute_score(
    issues: &[SecurityIssue],
    resources: &ResourceSnapshot,
    bugs: &[Bug],
    fixes: usize,
) -> u32 {
    let mut score: i64 = 100;
    for issue in issues {
        score -= match issue.severity {
            Severity::Critical | Severity::High => 15,
            Severity::Medium => 5,
            Severity::Low => 0,
        };
    }
    for usage in [resources.cpu_usage, resources.memory_usage] {
        if usage > 90.0 {
            score -= 20;
        } else if usage > 80.0 {
            score -= 10;
        }
    }
    score -= 10 * bugs.iter().filter(|b| b.severity >= Severity::High).count() as i64;
    score += (FIX_BONUS * fixes as u32).min(MAX_FIX_BONUS) as i64;
    score.clamp(0, 100) as u32
}

/// First occurrence of `at` strictly after `now`.
pub fn next_run_after(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

fn parse_run_at(value: &str) -> NaiveTime {
    NaiveTime::parse_from_str(value, "%H:%M").unwrap_or_else(|e| {
        warn!("Invalid audit run_at {:?} ({}), using 02:00", value, e);
        NaiveTime::from_hms_opt(DEFAULT_RUN_AT.0, DEFAULT_RUN_AT.1, 0).unwrap_or_default()
    })
}

pub struct AuditScheduler {
    config: AuditConfig,
    run_at: NaiveTime,
    services: Vec<String>,
    log: Arc<SecurityLog>,
    blocklist: Arc<BlocklistStore>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    sampler: Arc<dyn ResourceSampler>,
    supervisor: Arc<dyn ServiceSupervisor>,
    latest: RwLock<Option<AuditReport>>,
}

impl AuditScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AuditConfig,
        services: Vec<String>,
        log: Arc<SecurityLog>,
        blocklist: Arc<BlocklistStore>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        sampler: Arc<dyn ResourceSampler>,
        supervisor: Arc<dyn ServiceSupervisor>,
    ) -> Self {
        let run_at = parse_run_at(&config.run_at);
        Self {
            config,
            run_at,
            services,
            log,
            blocklist,
            limiter,
            cache,
            sampler,
            supervisor,
            latest: RwLock::new(None),
        }
    }

    /// Sleep until the next scheduled time, audit, repeat. Stops on shutdown.
    pub async fn run(&self, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();
        loop {
            let now = Local::now();
            let next = next_run_after(now.naive_local(), self.run_at);
            let wait = (next - now.naive_local()).to_std().unwrap_or(StdDuration::from_secs(60));
            info!("Next audit at {}", next);

            tokio::select! {
                _ = stop.recv() => break,
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.run_audit().await {
                        error!("Daily audit failed: {:#}", e);
                    }
                }
            }
        }
        info!("Audit scheduler stopped");
    }

    pub async fn run_audit(&self) -> Result<AuditReport> {
        let now = Utc::now();
        let since = now - Duration::hours(24);
        info!("Running security audit");

        let threats = self.log.threats_since(since).await.context("reading threat events")?;
        let mut summary = SecuritySummary {
            blocked_identities: self.blocklist.active_count().await.context("counting blocks")?,
            failed_logins: self.log.failed_logins_since(since).await.context("reading failed logins")?.len(),
            ..Default::default()
        };
        let security_issues: Vec<SecurityIssue> = threats
            .into_iter()
            .map(|e| SecurityIssue {
                event_id: e.id,
                threat_type: e.threat_type,
                severity: e.severity,
                source: e.source,
                status: e.status,
                detected_at: e.detected_at,
            })
            .collect();
        tally(&mut summary, &security_issues);

        let resources = match self.sampler.sample().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Audit resource sample failed: {:#}", e);
                ResourceSnapshot::default()
            }
        };
        let slow: Vec<SlowRequest> = self
            .log
            .since(SLOW_REQUESTS, since)
            .await
            .context("reading slow requests")?;

        let mut bugs = Vec::new();
        let mut fixes = Vec::new();
        let services = self.check_services(&mut bugs, &mut fixes).await;
        self.scan_logs(&mut bugs, &mut fixes).await;
        if slow.len() > self.config.slow_request_threshold {
            bugs.push(Bug {
                kind: BugKind::SlowResponses,
                severity: Severity::Medium,
                source: "requests".to_string(),
                detail: format!("{} requests over the slow threshold", slow.len()),
                occurrences: slow.len(),
            });
        }

        let score = compute_score(&security_issues, &resources, &bugs, fixes.len());
        let performance_metrics = PerformanceMetrics {
            resources,
            slow_requests: slow.len(),
            services,
        };
        let recommendations = recommend(&summary, &performance_metrics, &bugs);
        let report = AuditReport {
            id: Uuid::new_v4().to_string(),
            date: now,
            summary,
            security_issues,
            performance_metrics,
            bugs_detected: bugs,
            bugs_fixed: fixes,
            recommendations,
            score,
        };

        self.log
            .append(AUDIT_REPORTS, report.date, &report)
            .await
            .context("storing audit report")?;
        if let Ok(mut latest) = self.latest.write() {
            *latest = Some(report.clone());
        }
        metrics::gauge!("guard_audit_score", report.score as f64);
        info!(
            "Audit complete: score {}, {} issues, {} bugs, {} fixed",
            report.score,
            report.security_issues.len(),
            report.bugs_detected.len(),
            report.bugs_fixed.len()
        );
        Ok(report)
    }

    /// Query each service; a stopped one gets a single restart attempt.
    async fn check_services(&self, bugs: &mut Vec<Bug>, fixes: &mut Vec<BugFix>) -> Vec<ServiceStatus> {
        let mut statuses = Vec::new();
        for name in &self.services {
            let running = match self.supervisor.is_running(name).await {
                Ok(running) => running,
                Err(e) => {
                    warn!("Audit could not query {}: {}", name, e);
                    continue;
                }
            };
            let mut status = ServiceStatus {
                name: name.clone(),
                running,
                restarted: false,
            };
            if !running {
                bugs.push(Bug {
                    kind: BugKind::ServiceDown,
                    severity: Severity::High,
                    source: name.clone(),
                    detail: format!("service {} is not running", name),
                    occurrences: 1,
                });
                match self.supervisor.restart(name).await {
                    Ok(()) => {
                        status.restarted = true;
                        fixes.push(BugFix {
                            kind: BugKind::ServiceDown,
                            target: name.clone(),
                            action: "restarted".to_string(),
                        });
                    }
                    Err(e) => error!("Audit restart of {} failed: {}", name, e),
                }
            }
            statuses.push(status);
        }
        statuses
    }

    /// Group error lines per (log, signature). Exhaustion errors get one
    /// cache and counter clear per audit.
    async fn scan_logs(&self, bugs: &mut Vec<Bug>, fixes: &mut Vec<BugFix>) {
        let mut exhaustion = false;
        for source in &self.config.log_sources {
            let lines = match tail_lines(source, self.config.tail_lines).await {
                Ok(lines) => lines,
                Err(e) => {
                    warn!("Audit cannot read {}: {}", source, e);
                    continue;
                }
            };

            let mut found: HashMap<&'static str, (Severity, usize, String)> = HashMap::new();
            for line in &lines {
                let lower = line.to_lowercase();
                let hit = FATAL_SIGNATURES
                    .iter()
                    .find(|s| lower.contains(*s))
                    .map(|s| (*s, Severity::High))
                    .or_else(|| {
                        ERROR_SIGNATURES
                            .iter()
                            .find(|s| lower.contains(*s))
                            .map(|s| (*s, Severity::Medium))
                    });
                if let Some((signature, severity)) = hit {
                    let entry = found
                        .entry(signature)
                        .or_insert_with(|| (severity, 0, line.clone()));
                    entry.1 += 1;
                    exhaustion |= EXHAUSTION_SIGNATURES.iter().any(|s| lower.contains(s));
                }
            }

            let mut grouped: Vec<_> = found.into_iter().collect();
            grouped.sort_by_key(|(signature, _)| *signature);
            for (signature, (severity, occurrences, sample)) in grouped {
                bugs.push(Bug {
                    kind: BugKind::LogError,
                    severity,
                    source: source.clone(),
                    detail: format!("'{}': {}", signature, sample.chars().take(200).collect::<String>()),
                    occurrences,
                });
            }
        }

        if exhaustion {
            let released = self.cache.clear_local() + self.limiter.clear_local();
            info!("Audit cleared {} local cache and counter entries", released);
            fixes.push(BugFix {
                kind: BugKind::LogError,
                target: "local state".to_string(),
                action: format!("cleared {} cache and counter entries", released),
            });
        }
    }

    pub async fn latest(&self) -> Result<Option<AuditReport>> {
        if let Ok(latest) = self.latest.read() {
            if latest.is_some() {
                return Ok(latest.clone());
            }
        }
        let reports: Vec<AuditReport> = self
            .log
            .between(AUDIT_REPORTS, DateTime::<Utc>::MIN_UTC, Utc::now())
            .await
            .context("reading audit reports")?;
        Ok(reports.into_iter().max_by_key(|r| r.date))
    }

    pub async fn overview(&self) -> Result<AuditOverview> {
        let since = Utc::now() - Duration::hours(24);
        let threats = self.log.threats_since(since).await?;
        let issues: Vec<SecurityIssue> = threats
            .into_iter()
            .map(|e| SecurityIssue {
                event_id: e.id,
                threat_type: e.threat_type,
                severity: e.severity,
                source: e.source,
                status: e.status,
                detected_at: e.detected_at,
            })
            .collect();
        let mut live = SecuritySummary {
            blocked_identities: self.blocklist.active_count().await?,
            failed_logins: self.log.failed_logins_since(since).await?.len(),
            ..Default::default()
        };
        tally(&mut live, &issues);

        Ok(AuditOverview {
            latest: self.latest().await?,
            live,
            throttled: self.limiter.is_throttled(),
            generated_at: Utc::now(),
        })
    }
}

fn tally(summary: &mut SecuritySummary, issues: &[SecurityIssue]) {
    for issue in issues {
        match issue.severity {
            Severity::Critical => summary.critical += 1,
            Severity::High => summary.high += 1,
            Severity::Medium => summary.medium += 1,
            Severity::Low => summary.low += 1,
        }
        if issue.status == ThreatStatus::Detected {
            summary.unmitigated += 1;
        }
    }
}

fn recommend(summary: &SecuritySummary, perf: &PerformanceMetrics, bugs: &[Bug]) -> Vec<String> {
    let mut out = Vec::new();
    if summary.critical + summary.high > 0 {
        out.push(format!(
            "Review {} high severity threat events and the current blocklist",
            summary.critical + summary.high
        ));
    }
    if summary.unmitigated > 0 {
        out.push(format!("{} threat events were not mitigated automatically", summary.unmitigated));
    }
    if summary.failed_logins > 100 {
        out.push("Failed logins are elevated; consider stricter login limits".to_string());
    }
    if perf.resources.cpu_usage > 80.0 || perf.resources.memory_usage > 80.0 {
        out.push("Host resources are under pressure; consider scaling up".to_string());
    }
    if perf.resources.disk_usage > 90.0 {
        out.push("Disk usage is above 90%; rotate logs or grow the volume".to_string());
    }
    if perf.services.iter().any(|s| !s.running && !s.restarted) {
        out.push("Some services are down and could not be restarted".to_string());
    }
    if bugs.iter().any(|b| b.kind == BugKind::SlowResponses) {
        out.push("Investigate slow endpoints recorded in the last day".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::local_store::LocalStore;
    use crate::core::resources::StaticSampler;
    use crate::core::store::KvStore;
    use crate::core::supervisor::MockServiceSupervisor;
    use crate::core::threat::ThreatEvent;
    use crate::models::{CacheConfig, RateLimitConfig};
    use std::io::Write;

    fn issue(severity: Severity) -> SecurityIssue {
        SecurityIssue {
            event_id: Uuid::new_v4().to_string(),
            threat_type: ThreatType::MaliciousPayload,
            severity,
            source: "10.0.0.1".to_string(),
            status: ThreatStatus::Blocked,
            detected_at: Utc::now(),
        }
    }

    fn high_bug() -> Bug {
        Bug {
            kind: BugKind::ServiceDown,
            severity: Severity::High,
            source: "search".to_string(),
            detail: String::new(),
            occurrences: 1,
        }
    }

    #[test]
    fn test_nominal_day_scores_100() {
        assert_eq!(compute_score(&[], &ResourceSnapshot::default(), &[], 0), 100);
        // bonus cannot push past the ceiling
        assert_eq!(compute_score(&[], &ResourceSnapshot::default(), &[], 5), 100);
    }

    #[test]
    fn test_each_high_issue_costs_15() {
        let nominal = ResourceSnapshot::default();
        assert_eq!(compute_score(&[issue(Severity::High)], &nominal, &[], 0), 85);
        assert_eq!(
            compute_score(&[issue(Severity::High), issue(Severity::Critical)], &nominal, &[], 0),
            70
        );
        assert_eq!(compute_score(&[issue(Severity::Medium)], &nominal, &[], 0), 95);
        let many: Vec<_> = (0..10).map(|_| issue(Severity::High)).collect();
        assert_eq!(compute_score(&many, &nominal, &[], 0), 0);
    }

    #[test]
    fn test_resource_bug_and_fix_adjustments() {
        let hot = ResourceSnapshot {
            cpu_usage: 95.0,
            memory_usage: 85.0,
            ..Default::default()
        };
        assert_eq!(compute_score(&[], &hot, &[], 0), 70);
        assert_eq!(compute_score(&[], &hot, &[high_bug(), high_bug()], 0), 50);
        assert_eq!(compute_score(&[], &hot, &[high_bug(), high_bug()], 2), 54);
        assert_eq!(compute_score(&[], &hot, &[high_bug(), high_bug()], 9), 60);
    }

    #[test]
    fn test_next_run_after() {
        let at = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        let before = NaiveDateTime::parse_from_str("2026-10-18 01:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let after = NaiveDateTime::parse_from_str("2026-10-18 02:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(next_run_after(before, at).to_string(), "2026-10-18 02:00:00");
        assert_eq!(next_run_after(after, at).to_string(), "2026-10-19 02:00:00");
        assert_eq!(parse_run_at("bogus"), at);
    }

    #[tokio::test]
    async fn test_run_audit_scores_and_remedies() {
        let store: Arc<dyn KvStore> = Arc::new(LocalStore::default());
        let log = Arc::new(SecurityLog::new(store.clone()));
        for severity in [Severity::High, Severity::High, Severity::Medium] {
            let event = ThreatEvent::new(ThreatType::MaliciousPayload, severity, "10.0.0.9", "sqli");
            log.record_threat(&event).await.unwrap();
        }

        let path = std::env::temp_dir().join(format!("guard-error-{}.log", Uuid::new_v4()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "thread 'main' panicked at src/worker.rs:10").unwrap();
            writeln!(file, "worker killed: out of memory").unwrap();
            writeln!(file, "upstream error while reading response header").unwrap();
            writeln!(file, "GET /health 200").unwrap();
        }

        let mut supervisor = MockServiceSupervisor::new();
        supervisor.expect_is_running().returning(|s| Ok(s != "search"));
        supervisor.expect_restart().times(1).returning(|_| Ok(()));

        let audit = AuditScheduler::new(
            AuditConfig {
                log_sources: vec![path.to_string_lossy().to_string()],
                ..Default::default()
            },
            vec!["web".to_string(), "search".to_string()],
            log.clone(),
            Arc::new(BlocklistStore::new(store.clone())),
            Arc::new(RateLimiter::new(store.clone(), RateLimitConfig::default())),
            Arc::new(ResponseCache::new(store, &CacheConfig::default())),
            Arc::new(StaticSampler(ResourceSnapshot::default())),
            Arc::new(supervisor),
        );

        let report = audit.run_audit().await.unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(report.security_issues.len(), 3);
        assert_eq!(report.summary.high, 2);
        assert_eq!(report.bugs_detected.len(), 4);
        assert_eq!(
            report.bugs_detected.iter().filter(|b| b.severity == Severity::High).count(),
            3
        );
        assert_eq!(report.bugs_fixed.len(), 2);
        assert!(report.performance_metrics.services.iter().any(|s| s.name == "search" && s.restarted));
        // 100 - 30 - 5 - 30 + 4
        assert_eq!(report.score, 39);

        let latest = audit.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, report.id);
        let overview = audit.overview().await.unwrap();
        assert_eq!(overview.latest.unwrap().id, report.id);
        assert_eq!(overview.live.medium, 1);
    }

    #[tokio::test]
    async fn test_latest_reads_stored_reports() {
        let store: Arc<dyn KvStore> = Arc::new(LocalStore::default());
        let log = Arc::new(SecurityLog::new(store.clone()));
        let make = || {
            AuditScheduler::new(
                AuditConfig {
                    log_sources: Vec::new(),
                    ..Default::default()
                },
                Vec::new(),
                log.clone(),
                Arc::new(BlocklistStore::new(store.clone())),
                Arc::new(RateLimiter::new(store.clone(), RateLimitConfig::default())),
                Arc::new(ResponseCache::new(store.clone(), &CacheConfig::default())),
                Arc::new(StaticSampler(ResourceSnapshot::default())),
                Arc::new(MockServiceSupervisor::new()),
            )
        };

        let writer = make();
        assert!(writer.latest().await.unwrap().is_none());
        writer.run_audit().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let second = writer.run_audit().await.unwrap();
        assert_eq!(second.score, 100);

        // a fresh scheduler (another replica) sees the stored report
        let reader = make();
        assert_eq!(reader.latest().await.unwrap().unwrap().id, second.id);
    }
}
