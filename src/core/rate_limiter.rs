//! Rate limiting implementation for the traffic guard.
//!
//! Requests are counted per identity and endpoint class over a one-minute
//! and a one-hour window. Counting goes through the backing store, so the
//! windows are shared across replicas while Redis is up and fall back to
//! per-process sliding windows when it is not.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::models::{ClassLimits, RateLimitConfig};
use crate::utils::format_rate_limit_key;
use super::store::KvStore;

const PREFIX: &str = "rate_limit";
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Errors that can occur during rate limiting operations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {count} requests per {window} on {class} endpoints (limit {limit})")]
    ExceededLimit {
        class: EndpointClass,
        window: &'static str,
        count: u64,
        limit: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Sensitive,
    Public,
    Default,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Sensitive => "sensitive",
            EndpointClass::Public => "public",
            EndpointClass::Default => "default",
        }
    }
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub backend: &'static str,
    pub throttle_percent: u32,
    pub checked: u64,
    pub exceeded: u64,
    pub sensitive: ClassLimits,
    pub public: ClassLimits,
    pub default: ClassLimits,
}

/// Rate limiter over the shared backing store
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    config: RateLimitConfig,
    /// Percentage of the configured ceilings currently in force
    throttle_percent: AtomicU32,
    checked: AtomicU64,
    exceeded: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter instance
    pub fn new(store: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            throttle_percent: AtomicU32::new(100),
            checked: AtomicU64::new(0),
            exceeded: AtomicU64::new(0),
        }
    }

    /// Classify a request path by prefix. Sensitive prefixes are checked first.
    pub fn classify(&self, path: &str) -> EndpointClass {
        if self.config.sensitive_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            EndpointClass::Sensitive
        } else if self.config.public_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            EndpointClass::Public
        } else {
            EndpointClass::Default
        }
    }

    /// Ceilings for `class` after any active throttle.
    pub fn limits(&self, class: EndpointClass) -> ClassLimits {
        let base = match class {
            EndpointClass::Sensitive => self.config.sensitive,
            EndpointClass::Public => self.config.public,
            EndpointClass::Default => self.config.default,
        };
        let pct = self.throttle_percent.load(Ordering::Relaxed) as u64;
        let scale = |v: u32| ((v as u64 * pct) / 100).max(1) as u32;
        ClassLimits {
            per_minute: scale(base.per_minute),
            per_hour: scale(base.per_hour),
        }
    }

    /// Count this request and check both windows.
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the request should be allowed
    /// * `Err(RateLimitError::ExceededLimit)` if either ceiling has been exceeded
    ///
    /// A store failure allows the request; the tiered store has already
    /// fallen back to local counters by the time an error could reach here.
    pub async fn check_rate_limit(&self, identity: &str, class: EndpointClass) -> Result<(), RateLimitError> {
        self.checked.fetch_add(1, Ordering::Relaxed);
        let limits = self.limits(class);
        let base = format_rate_limit_key(PREFIX, &format!("{}:{}", class, identity));

        for (suffix, window, limit) in [("minute", MINUTE, limits.per_minute), ("hour", HOUR, limits.per_hour)] {
            let count = match self.store.hit(&format_rate_limit_key(&base, suffix), window).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Rate counter unavailable for {}: {}", identity, e);
                    return Ok(());
                }
            };
            if count > limit as u64 {
                self.exceeded.fetch_add(1, Ordering::Relaxed);
                return Err(RateLimitError::ExceededLimit {
                    class,
                    window: suffix,
                    count,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Lower every ceiling to `percent` of its configured value until [`restore`](Self::restore).
    pub fn throttle(&self, percent: u32) {
        let percent = percent.clamp(1, 100);
        self.throttle_percent.store(percent, Ordering::Relaxed);
        warn!("Rate limits throttled to {}% of configured ceilings", percent);
    }

    pub fn restore(&self) {
        if self.throttle_percent.swap(100, Ordering::Relaxed) != 100 {
            info!("Rate limits restored to configured ceilings");
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.throttle_percent.load(Ordering::Relaxed) < 100
    }

    /// Drop process-local counters.
    pub fn clear_local(&self) -> usize {
        self.store.purge_local(&[PREFIX])
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            backend: self.store.backend(),
            throttle_percent: self.throttle_percent.load(Ordering::Relaxed),
            checked: self.checked.load(Ordering::Relaxed),
            exceeded: self.exceeded.load(Ordering::Relaxed),
            sensitive: self.limits(EndpointClass::Sensitive),
            public: self.limits(EndpointClass::Public),
            default: self.limits(EndpointClass::Default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::local_store::LocalStore;

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(LocalStore::default()), config)
    }

    #[tokio::test]
    async fn test_rate_limiter() {
        let mut config = RateLimitConfig::default();
        config.sensitive = ClassLimits {
            per_minute: 2,
            per_hour: 10,
        };
        let limiter = limiter(config);

        // First request should succeed
        assert!(limiter.check_rate_limit("10.0.0.1", EndpointClass::Sensitive).await.is_ok());

        // Second request should succeed
        assert!(limiter.check_rate_limit("10.0.0.1", EndpointClass::Sensitive).await.is_ok());

        // Third request should fail
        assert!(matches!(
            limiter.check_rate_limit("10.0.0.1", EndpointClass::Sensitive).await,
            Err(RateLimitError::ExceededLimit { window: "minute", .. })
        ));

        // Other identities and classes are counted separately
        assert!(limiter.check_rate_limit("10.0.0.2", EndpointClass::Sensitive).await.is_ok());
        assert!(limiter.check_rate_limit("10.0.0.1", EndpointClass::Public).await.is_ok());

        // Clearing local counters starts the windows over
        assert!(limiter.clear_local() > 0);
        assert!(limiter.check_rate_limit("10.0.0.1", EndpointClass::Sensitive).await.is_ok());
    }

    #[tokio::test]
    async fn test_hour_ceiling() {
        let mut config = RateLimitConfig::default();
        config.default = ClassLimits {
            per_minute: 100,
            per_hour: 3,
        };
        let limiter = limiter(config);
        for _ in 0..3 {
            tokio_test::assert_ok!(limiter.check_rate_limit("10.0.0.9", EndpointClass::Default).await);
        }
        let err = limiter.check_rate_limit("10.0.0.9", EndpointClass::Default).await.unwrap_err();
        assert_eq!(
            err,
            RateLimitError::ExceededLimit {
                class: EndpointClass::Default,
                window: "hour",
                count: 4,
                limit: 3
            }
        );
    }

    #[test]
    fn test_classify() {
        let limiter = limiter(RateLimitConfig::default());
        assert_eq!(limiter.classify("/api/auth/login"), EndpointClass::Sensitive);
        assert_eq!(limiter.classify("/checkout/confirm"), EndpointClass::Sensitive);
        assert_eq!(limiter.classify("/api/products/42"), EndpointClass::Public);
        assert_eq!(limiter.classify("/cached/x"), EndpointClass::Public);
        assert_eq!(limiter.classify("/api/cart"), EndpointClass::Default);
    }

    #[test]
    fn test_throttle_and_restore() {
        let limiter = limiter(RateLimitConfig::default());
        limiter.throttle(50);
        assert!(limiter.is_throttled());
        assert_eq!(limiter.limits(EndpointClass::Public).per_minute, 60);
        assert_eq!(limiter.limits(EndpointClass::Sensitive).per_minute, 5);

        limiter.restore();
        assert!(!limiter.is_throttled());
        assert_eq!(limiter.limits(EndpointClass::Public).per_minute, 120);
    }
}
