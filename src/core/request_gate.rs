//! Per-request admission control.
//!
//! Every inbound request is resolved to a client identity and checked, in
//! order, against the blocklist, the rate limiter and the payload rules
//! before any business handler runs. The HTTP adapter lives in
//! `api::middleware`; this module has no framework dependency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use log::{error, warn};
use serde::Serialize;
use thiserror::Error;

use crate::models::{GateConfig, RateLimitConfig};
use super::blocklist::BlocklistStore;
use super::cache::ResponseCache;
use super::patterns::PatternSet;
use super::rate_limiter::{EndpointClass, RateLimiter};
use super::security_log::{SecurityLog, SlowRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Blocked,
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    BodyTooLarge,
    SuspiciousPattern,
}

/// Outcomes of admission control. Display strings are for server logs only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("admission denied for {identity}: {reason:?}")]
    AdmissionDenied { identity: String, reason: DenyReason },
    #[error("validation failed for {identity}: {reason:?}")]
    ValidationFailed { identity: String, reason: InvalidReason },
    #[error("internal error: {0}")]
    UnexpectedInternal(String),
}

/// What the gate needs to know about a request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub content_length: Option<u64>,
    pub forwarded_for: Option<&'a str>,
    pub real_ip: Option<&'a str>,
    pub peer: Option<String>,
}

impl RequestMeta<'_> {
    /// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the socket peer.
    pub fn identity(&self) -> String {
        self.forwarded_for
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| self.real_ip.map(str::trim).filter(|v| !v.is_empty()))
            .map(str::to_string)
            .or_else(|| self.peer.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// An admitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub identity: String,
    pub class: EndpointClass,
    /// Set when the response may be served from or stored in the cache
    pub cache_ttl: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub admitted: u64,
    pub blocked: u64,
    pub rate_limited: u64,
    pub invalid: u64,
    pub slow: u64,
}

#[derive(Default)]
struct GateCounters {
    admitted: AtomicU64,
    blocked: AtomicU64,
    rate_limited: AtomicU64,
    invalid: AtomicU64,
    slow: AtomicU64,
}

pub struct RequestGate {
    config: GateConfig,
    block_duration: Duration,
    blocklist: Arc<BlocklistStore>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    patterns: Arc<PatternSet>,
    log: Arc<SecurityLog>,
    counters: GateCounters,
}

impl RequestGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GateConfig,
        rate_limit: &RateLimitConfig,
        blocklist: Arc<BlocklistStore>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        patterns: Arc<PatternSet>,
        log: Arc<SecurityLog>,
    ) -> Self {
        Self {
            config,
            block_duration: Duration::minutes(rate_limit.block_minutes as i64),
            blocklist,
            limiter,
            cache,
            patterns,
            log,
            counters: GateCounters::default(),
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Run the block, rate and validation checks for one request.
    pub async fn admit(&self, meta: &RequestMeta<'_>) -> Result<Admission, GateError> {
        let identity = meta.identity();
        metrics::increment_counter!("guard_requests_total");

        if self.blocklist.is_blocked(&identity).await {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!("guard_requests_rejected_total", "reason" => "blocked");
            warn!("Security event: blocked identity {} requested {} {}", identity, meta.method, meta.path);
            return Err(GateError::AdmissionDenied {
                identity,
                reason: DenyReason::Blocked,
            });
        }

        let class = self.limiter.classify(meta.path);
        if let Err(e) = self.limiter.check_rate_limit(&identity, class).await {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!("guard_requests_rejected_total", "reason" => "rate_limited");
            warn!("Security event: {} from {}; blocking for {} minutes", e, identity, self.block_duration.num_minutes());
            if let Err(err) = self
                .blocklist
                .block(&identity, &e.to_string(), self.block_duration, true)
                .await
            {
                error!("Failed to block {} after rate limit: {}", identity, err);
            }
            return Err(GateError::AdmissionDenied {
                identity,
                reason: DenyReason::RateLimited,
            });
        }

        if let Err(reason) = self.validate(meta) {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!("guard_requests_rejected_total", "reason" => "invalid");
            warn!(
                "Security event: rejected {} {} from {} ({:?})",
                meta.method, meta.path, identity, reason
            );
            return Err(GateError::ValidationFailed { identity, reason });
        }

        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(Admission {
            identity,
            class,
            cache_ttl: self.cache.ttl_for(meta.method, meta.path),
        })
    }

    /// Body size ceiling and suspicious-pattern check.
    pub fn validate(&self, meta: &RequestMeta<'_>) -> Result<(), InvalidReason> {
        if meta.content_length.map_or(false, |len| len > self.config.max_body_bytes) {
            return Err(InvalidReason::BodyTooLarge);
        }
        if self.patterns.is_suspicious_request(meta.path, meta.query) {
            return Err(InvalidReason::SuspiciousPattern);
        }
        Ok(())
    }

    /// Record requests slower than the configured threshold for the daily audit.
    pub fn finish(&self, admission: &Admission, method: &str, path: &str, elapsed: StdDuration) {
        if elapsed < StdDuration::from_millis(self.config.slow_request_ms) {
            return;
        }
        self.counters.slow.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Slow request: {} {} from {} took {} ms",
            method,
            path,
            admission.identity,
            elapsed.as_millis()
        );
        let record = SlowRequest {
            identity: admission.identity.clone(),
            method: method.to_string(),
            path: path.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            at: Utc::now(),
        };
        let log = self.log.clone();
        tokio::spawn(async move {
            if let Err(e) = log.record_slow_request(&record).await {
                warn!("Failed to record slow request: {}", e);
            }
        });
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            slow: self.counters.slow.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::local_store::LocalStore;
    use crate::core::store::KvStore;
    use crate::models::{CacheConfig, ClassLimits};

    fn gate(rate_limit: RateLimitConfig) -> (RequestGate, Arc<BlocklistStore>) {
        let store: Arc<dyn KvStore> = Arc::new(LocalStore::default());
        let blocklist = Arc::new(BlocklistStore::new(store.clone()));
        let gate = RequestGate::new(
            GateConfig::default(),
            &rate_limit,
            blocklist.clone(),
            Arc::new(RateLimiter::new(store.clone(), rate_limit.clone())),
            Arc::new(ResponseCache::new(store.clone(), &CacheConfig::default())),
            Arc::new(PatternSet::default()),
            Arc::new(SecurityLog::new(store)),
        );
        (gate, blocklist)
    }

    fn get(path: &'static str, ip: &'static str) -> RequestMeta<'static> {
        RequestMeta {
            method: "GET",
            path,
            forwarded_for: Some(ip),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_priority() {
        let meta = RequestMeta {
            forwarded_for: Some(" 198.51.100.7 , 10.0.0.1"),
            real_ip: Some("10.0.0.2"),
            peer: Some("127.0.0.1".into()),
            ..Default::default()
        };
        assert_eq!(meta.identity(), "198.51.100.7");

        let meta = RequestMeta {
            real_ip: Some("10.0.0.2"),
            peer: Some("127.0.0.1".into()),
            ..Default::default()
        };
        assert_eq!(meta.identity(), "10.0.0.2");

        let meta = RequestMeta {
            forwarded_for: Some(""),
            peer: Some("127.0.0.1".into()),
            ..Default::default()
        };
        assert_eq!(meta.identity(), "127.0.0.1");
        assert_eq!(RequestMeta::default().identity(), "unknown");
    }

    #[tokio::test]
    async fn test_sensitive_ceiling_blocks_identity() {
        let mut config = RateLimitConfig::default();
        config.sensitive = ClassLimits {
            per_minute: 3,
            per_hour: 100,
        };
        let (gate, blocklist) = gate(config);

        for _ in 0..3 {
            assert!(gate.admit(&get("/login", "10.1.1.1")).await.is_ok());
        }
        let err = gate.admit(&get("/login", "10.1.1.1")).await.unwrap_err();
        assert_eq!(
            err,
            GateError::AdmissionDenied {
                identity: "10.1.1.1".into(),
                reason: DenyReason::RateLimited
            }
        );

        let entry = blocklist.get("10.1.1.1").await.unwrap().unwrap();
        let minutes = (entry.expires_at.unwrap() - entry.blocked_at).num_minutes();
        assert!((14..=15).contains(&minutes));

        // now refused before counting, on any endpoint
        let err = gate.admit(&get("/api/products", "10.1.1.1")).await.unwrap_err();
        assert!(matches!(err, GateError::AdmissionDenied { reason: DenyReason::Blocked, .. }));
        assert!(gate.admit(&get("/login", "10.1.1.2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_validation_rejections() {
        let (gate, _) = gate(RateLimitConfig::default());

        let big = RequestMeta {
            method: "POST",
            path: "/api/contact",
            content_length: Some(10 * 1024 * 1024 + 1),
            forwarded_for: Some("10.2.2.2"),
            ..Default::default()
        };
        assert!(matches!(
            gate.admit(&big).await,
            Err(GateError::ValidationFailed { reason: InvalidReason::BodyTooLarge, .. })
        ));

        let evil = RequestMeta {
            method: "GET",
            path: "/api/products",
            query: "id=1%27%20OR%20%271%27%3D%271",
            forwarded_for: Some("10.2.2.2"),
            ..Default::default()
        };
        for _ in 0..3 {
            assert!(matches!(
                gate.admit(&evil).await,
                Err(GateError::ValidationFailed { reason: InvalidReason::SuspiciousPattern, .. })
            ));
        }
        assert_eq!(gate.stats().invalid, 4);
    }

    #[tokio::test]
    async fn test_admission_carries_cache_ttl() {
        let (gate, _) = gate(RateLimitConfig::default());
        let admission = gate.admit(&get("/api/products/9", "10.3.3.3")).await.unwrap();
        assert_eq!(admission.class, EndpointClass::Public);
        assert_eq!(admission.cache_ttl, Some(Duration::seconds(300)));

        let admission = gate.admit(&get("/api/cart", "10.3.3.3")).await.unwrap();
        assert_eq!(admission.cache_ttl, None);
    }
}
