//! Core functionality for the traffic guard.
//!
//! Admission control and caching on the request path, plus the background
//! threat monitor, mitigation engine and daily audit that share the same
//! backing store.

pub mod alerts;
pub mod audit;
pub mod blocklist;
pub mod cache;
pub mod local_store;
pub mod mitigation;
pub mod monitoring;
pub mod patterns;
pub mod rate_limiter;
pub mod redis_store;
pub mod request_gate;
pub mod resources;
pub mod security_log;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod threat;

pub use alerts::Alerter;
pub use audit::{AuditReport, AuditScheduler};
pub use blocklist::{BlockEntry, BlocklistStore};
pub use cache::ResponseCache;
pub use mitigation::MitigationEngine;
pub use monitoring::ThreatMonitor;
pub use patterns::PatternSet;
pub use rate_limiter::{EndpointClass, RateLimiter};
pub use request_gate::{GateError, RequestGate, RequestMeta};
pub use security_log::SecurityLog;
pub use shutdown::Shutdown;
pub use store::KvStore;
pub use threat::{Severity, ThreatEvent, ThreatStatus, ThreatType};
