use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Upper bound for a single store call before falling back to local state
    pub timeout_ms: u64,
    /// Maximum documents kept per collection by the local fallback
    pub local_max_documents: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            timeout_ms: 50,
            local_max_documents: 10_000,
        }
    }
}

/// Per-class request ceilings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Login, checkout, admin and payment endpoints
    pub sensitive: ClassLimits,
    /// Catalog and content endpoints
    pub public: ClassLimits,
    /// Everything else
    pub default: ClassLimits,
    pub sensitive_prefixes: Vec<String>,
    pub public_prefixes: Vec<String>,
    /// How long an identity stays blocked after tripping a ceiling
    pub block_minutes: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sensitive: ClassLimits {
                per_minute: 10,
                per_hour: 100,
            },
            public: ClassLimits {
                per_minute: 120,
                per_hour: 2000,
            },
            default: ClassLimits {
                per_minute: 60,
                per_hour: 1000,
            },
            sensitive_prefixes: vec![
                "/login".to_string(),
                "/api/auth".to_string(),
                "/admin".to_string(),
                "/checkout".to_string(),
                "/api/payment".to_string(),
            ],
            public_prefixes: vec![
                "/api/products".to_string(),
                "/blog".to_string(),
                "/static".to_string(),
                "/cached".to_string(),
            ],
            block_minutes: 15,
        }
    }
}

/// Admission gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Largest accepted request body in bytes
    pub max_body_bytes: u64,
    /// Requests slower than this are recorded for the audit
    pub slow_request_ms: u64,
    /// Regular expressions flagging injection attempts in path or query
    pub suspicious_patterns: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            slow_request_ms: 2000,
            suspicious_patterns: crate::core::patterns::default_patterns(),
        }
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Path prefix -> TTL in seconds. Prefixes with a TTL of zero are not cached.
    pub routes: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut routes = HashMap::new();
        routes.insert("/api/products".to_string(), 300);
        routes.insert("/api/categories".to_string(), 3600);
        routes.insert("/blog".to_string(), 600);
        routes.insert("/cached".to_string(), 60);
        Self { routes }
    }
}

/// Blocklist configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BlocklistConfig {
    /// Identities denied without expiry
    pub permanent: Vec<String>,
}

/// Alert thresholds for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// CPU usage threshold for a MEDIUM finding (percentage)
    pub cpu_usage: f64,
    /// CPU usage threshold for a HIGH finding (percentage)
    pub cpu_critical: f64,
    /// Memory usage threshold for a MEDIUM finding (percentage)
    pub memory_usage: f64,
    /// Memory usage threshold for a HIGH finding (percentage)
    pub memory_critical: f64,
    /// Disk usage threshold (percentage)
    pub disk_usage: f64,
    /// Open TCP connections considered anomalous
    pub connections: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_usage: 80.0,
            cpu_critical: 90.0,
            memory_usage: 80.0,
            memory_critical: 90.0,
            disk_usage: 90.0,
            connections: 1000,
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether to enable monitoring
    pub enabled: bool,
    /// Monitoring interval in seconds
    pub interval_seconds: u64,
    /// Pause after a cycle in which any check failed
    pub backoff_seconds: u64,
    /// Log files tailed every cycle
    pub log_sources: Vec<String>,
    /// Number of trailing lines read per log source
    pub tail_lines: usize,
    pub failed_login_window_minutes: i64,
    pub failed_login_threshold: usize,
    /// 404s on sensitive-looking paths before an identity counts as a scanner
    pub scan_404_threshold: usize,
    pub scan_paths: Vec<String>,
    /// Suppress re-emitting the same (type, identity) pair for this long
    pub dedupe_minutes: i64,
    /// Services whose liveness is checked through the supervisor
    pub services: Vec<String>,
    /// Alert thresholds
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            backoff_seconds: 60,
            log_sources: vec![
                "/var/log/nginx/access.log".to_string(),
                "/var/log/nginx/error.log".to_string(),
            ],
            tail_lines: 1000,
            failed_login_window_minutes: 15,
            failed_login_threshold: 5,
            scan_404_threshold: 10,
            scan_paths: vec![
                "/.env".to_string(),
                "/.git".to_string(),
                "/wp-admin".to_string(),
                "/wp-login".to_string(),
                "/phpmyadmin".to_string(),
                "/admin".to_string(),
                "/config".to_string(),
                "/backup".to_string(),
            ],
            dedupe_minutes: 10,
            services: Vec::new(),
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

/// When a DDoS throttle is lifted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestorePolicy {
    /// Restore after a fixed cooldown regardless of current traffic
    Fixed,
    /// Re-sample connections at the end of the cooldown and extend while still anomalous
    Reevaluate,
}

/// Mitigation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MitigationConfig {
    pub brute_force_block_hours: i64,
    pub payload_block_hours: i64,
    /// Percentage of the normal ceilings kept while throttled
    pub ddos_throttle_percent: u32,
    pub ddos_throttle_seconds: u64,
    pub ddos_restore_policy: RestorePolicy,
    pub ddos_max_extensions: u32,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            brute_force_block_hours: 24,
            payload_block_hours: 1,
            ddos_throttle_percent: 50,
            ddos_throttle_seconds: 300,
            ddos_restore_policy: RestorePolicy::Fixed,
            ddos_max_extensions: 6,
        }
    }
}

/// Daily audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Local wall-clock time of the daily run, `HH:MM`
    pub run_at: String,
    /// Log files scanned for error signatures
    pub log_sources: Vec<String>,
    pub tail_lines: usize,
    /// Slow requests per day above which a performance bug is reported
    pub slow_request_threshold: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_at: "02:00".to_string(),
            log_sources: vec![
                "/var/log/app/error.log".to_string(),
                "/var/log/nginx/error.log".to_string(),
            ],
            tail_lines: 2000,
            slow_request_threshold: 50,
        }
    }
}

/// Alert delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Optional endpoint receiving every alert as JSON
    pub webhook_url: Option<String>,
    pub webhook_timeout_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_ms: 3000,
        }
    }
}

/// Process supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Control program, invoked as `<program> status <name>` / `<program> restart <name>`
    pub program: String,
    pub timeout_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: "supervisorctl".to_string(),
            timeout_seconds: 30,
        }
    }
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Rate limit configuration
    pub rate_limit: RateLimitConfig,
    /// Admission gate configuration
    pub gate: GateConfig,
    /// Response cache configuration
    pub cache: CacheConfig,
    /// Blocklist configuration
    pub blocklist: BlocklistConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
    /// Mitigation configuration
    pub mitigation: MitigationConfig,
    /// Audit configuration
    pub audit: AuditConfig,
    /// Alert delivery
    pub alerts: AlertsConfig,
    /// Process supervisor
    pub supervisor: SupervisorConfig,
}
