//! API endpoints for the traffic guard.
//!
//! Management routes for operations tooling: statistics, blocklist
//! administration, cache flushes, the latest audit report, the event intake
//! used by business handlers, and the Prometheus scrape endpoint.

pub mod middleware;

use std::sync::Arc;

use actix_web::{http::StatusCode, web, HttpResponse, Responder, ResponseError};
use chrono::{Duration, Utc};
use log::error;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::core::audit::AuditScheduler;
use crate::core::blocklist::{BlockOutcome, BlocklistStore};
use crate::core::cache::{CacheStats, ResponseCache};
use crate::core::rate_limiter::{RateLimitStats, RateLimiter};
use crate::core::request_gate::{GateStats, RequestGate};
use crate::core::security_log::SecurityLog;
use crate::core::store::StoreError;

pub use middleware::protect;

pub struct ApiState {
    pub gate: Arc<RequestGate>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<ResponseCache>,
    pub blocklist: Arc<BlocklistStore>,
    pub log: Arc<SecurityLog>,
    pub audit: Arc<AuditScheduler>,
    pub metrics: PrometheusHandle,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
    #[error("{0}")]
    BadRequest(&'static str),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            ApiError::BadRequest(message) => *message,
            other => {
                error!("Management API error: {:#}", other);
                "Service temporarily unavailable"
            }
        };
        HttpResponse::build(self.status_code()).json(json!({ "error": message }))
    }
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(
                web::scope("/security")
                    .service(web::resource("/stats").route(web::get().to(security_stats)))
                    .service(
                        web::resource("/blocklist")
                            .route(web::get().to(list_blocks))
                            .route(web::post().to(add_block)),
                    )
                    .service(web::resource("/blocklist/{identity}").route(web::delete().to(remove_block)))
                    .service(web::resource("/cache/flush").route(web::post().to(flush_cache)))
                    .service(web::resource("/audit/latest").route(web::get().to(latest_audit)))
                    .service(web::resource("/audit/overview").route(web::get().to(audit_overview)))
                    .service(web::resource("/events/failed-login").route(web::post().to(record_failed_login)))
                    .service(web::resource("/events/payload").route(web::post().to(record_payload))),
            ),
    )
    .service(web::resource("/metrics").route(web::get().to(render_metrics)));
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    store: &'static str,
}

#[derive(Serialize)]
struct SecurityStats {
    gate: GateStats,
    rate_limiter: RateLimitStats,
    cache: CacheStats,
    blocked_identities: usize,
    threats_last_24h: usize,
    audit_score: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRequest {
    pub identity: String,
    pub reason: String,
    /// Omit for a permanent block
    pub minutes: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlushRequest {
    pub pattern: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailedLoginEvent {
    pub identity: String,
    pub username: Option<String>,
    pub endpoint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PayloadEvent {
    pub identity: String,
    pub endpoint: String,
    pub payload: String,
}

/// Health check endpoint
async fn health_check(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: state.cache.stats().backend,
    })
}

async fn security_stats(state: web::Data<ApiState>) -> Result<HttpResponse, ApiError> {
    let threats = state.log.threats_since(Utc::now() - Duration::hours(24)).await?;
    let latest = state.audit.latest().await?;
    Ok(HttpResponse::Ok().json(SecurityStats {
        gate: state.gate.stats(),
        rate_limiter: state.limiter.stats(),
        cache: state.cache.stats(),
        blocked_identities: state.blocklist.active_count().await?,
        threats_last_24h: threats.len(),
        audit_score: latest.map(|r| r.score),
    }))
}

async fn list_blocks(state: web::Data<ApiState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.blocklist.list().await?))
}

async fn add_block(state: web::Data<ApiState>, body: web::Json<BlockRequest>) -> Result<HttpResponse, ApiError> {
    if body.identity.trim().is_empty() {
        return Err(ApiError::BadRequest("identity is required"));
    }
    let outcome = match body.minutes {
        Some(minutes) if minutes <= 0 => return Err(ApiError::BadRequest("minutes must be positive")),
        Some(minutes) => {
            let ttl = Duration::try_minutes(minutes)
                .filter(|ttl| Utc::now().checked_add_signed(*ttl).is_some())
                .ok_or(ApiError::BadRequest("minutes is out of range"))?;
            state.blocklist.block(&body.identity, &body.reason, ttl, false).await?
        }
        None => state.blocklist.block_permanent(&body.identity, &body.reason).await?,
    };
    let entry = state.blocklist.get(&body.identity).await?;
    let status = match outcome {
        BlockOutcome::Created => StatusCode::CREATED,
        BlockOutcome::Extended | BlockOutcome::Unchanged => StatusCode::OK,
    };
    Ok(HttpResponse::build(status).json(json!({ "outcome": format!("{:?}", outcome), "entry": entry })))
}

async fn remove_block(state: web::Data<ApiState>, identity: web::Path<String>) -> Result<HttpResponse, ApiError> {
    if state.blocklist.unblock(&identity).await? {
        Ok(HttpResponse::Ok().json(json!({ "removed": true })))
    } else {
        Ok(HttpResponse::NotFound().json(json!({ "removed": false })))
    }
}

async fn flush_cache(state: web::Data<ApiState>, body: web::Json<FlushRequest>) -> Result<HttpResponse, ApiError> {
    let removed = state.cache.flush(&body.pattern).await?;
    Ok(HttpResponse::Ok().json(json!({ "removed": removed })))
}

async fn latest_audit(state: web::Data<ApiState>) -> Result<HttpResponse, ApiError> {
    match state.audit.latest().await? {
        Some(report) => Ok(HttpResponse::Ok().json(report)),
        None => Ok(HttpResponse::NotFound().json(json!({ "error": "No audit report yet" }))),
    }
}

/// Latest report alongside the live 24h counters.
async fn audit_overview(state: web::Data<ApiState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.audit.overview().await?))
}

async fn record_failed_login(
    state: web::Data<ApiState>,
    body: web::Json<FailedLoginEvent>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    state
        .log
        .record_failed_login(&body.identity, body.username, &body.endpoint)
        .await?;
    Ok(HttpResponse::Accepted().finish())
}

async fn record_payload(state: web::Data<ApiState>, body: web::Json<PayloadEvent>) -> Result<HttpResponse, ApiError> {
    state
        .log
        .record_payload(&body.identity, &body.endpoint, &body.payload)
        .await?;
    Ok(HttpResponse::Accepted().finish())
}

async fn render_metrics(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.metrics.render())
}
