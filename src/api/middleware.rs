//! actix-web adapter for the request gate and the response cache.
//!
//! Wrap an `App` with `from_fn(protect)` and register the gate as
//! `web::Data<RequestGate>`.

use std::time::Instant;

use actix_web::body::{to_bytes, BoxBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::middleware::Next;
use actix_web::{web, Error, HttpResponse, ResponseError};
use log::{error, warn};
use serde_json::json;

use crate::core::cache::CacheEntry;
use crate::core::request_gate::{GateError, RequestGate, RequestMeta};

const X_PROCESS_TIME: &str = "x-process-time";
const X_CACHE: &str = "x-cache";

/// Response headers never replayed from the cache.
const HOP_HEADERS: [&str; 5] = ["content-length", "content-type", "date", "connection", "transfer-encoding"];

impl ResponseError for GateError {
    fn status_code(&self) -> StatusCode {
        match self {
            GateError::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            GateError::UnexpectedInternal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            GateError::AdmissionDenied { .. } => "Too many requests",
            GateError::ValidationFailed { .. } => "Bad request",
            GateError::UnexpectedInternal(detail) => {
                error!("Request gate failure: {}", detail);
                "Internal server error"
            }
        };
        HttpResponse::build(self.status_code()).json(json!({ "error": message }))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Admission, cache and timing for every request.
pub async fn protect(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, Error> {
    let started = Instant::now();
    let gate = req
        .app_data::<web::Data<RequestGate>>()
        .cloned()
        .ok_or_else(|| GateError::UnexpectedInternal("request gate not registered".to_string()))?;

    let method = req.method().as_str().to_string();
    let path = req.path().to_string();
    let query = req.query_string().to_string();
    let admission = {
        let headers = req.headers();
        let meta = RequestMeta {
            method: &method,
            path: &path,
            query: &query,
            content_length: header_str(headers, "content-length").and_then(|v| v.parse().ok()),
            forwarded_for: header_str(headers, "x-forwarded-for"),
            real_ip: header_str(headers, "x-real-ip"),
            peer: req.peer_addr().map(|addr| addr.ip().to_string()),
        };
        gate.admit(&meta).await?
    };

    if let Some(ttl) = admission.cache_ttl {
        if let Some(entry) = gate.cache().lookup(&path, &query).await {
            let mut res = req.into_response(replay(entry));
            stamp(res.headers_mut(), Some("HIT"), started);
            gate.finish(&admission, &method, &path, started.elapsed());
            return Ok(res);
        }

        let res = next.call(req).await?;
        let mut res = if res.status() == StatusCode::OK {
            store_response(&gate, &path, &query, ttl, res).await?
        } else {
            res.map_into_boxed_body()
        };
        stamp(res.headers_mut(), Some("MISS"), started);
        gate.finish(&admission, &method, &path, started.elapsed());
        return Ok(res);
    }

    let mut res = next.call(req).await?.map_into_boxed_body();
    stamp(res.headers_mut(), None, started);
    gate.finish(&admission, &method, &path, started.elapsed());
    Ok(res)
}

fn stamp(headers: &mut HeaderMap, cache: Option<&'static str>, started: Instant) {
    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", started.elapsed().as_secs_f64())) {
        headers.insert(HeaderName::from_static(X_PROCESS_TIME), value);
    }
    if let Some(cache) = cache {
        headers.insert(HeaderName::from_static(X_CACHE), HeaderValue::from_static(cache));
    }
}

fn replay(entry: CacheEntry) -> HttpResponse {
    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &entry.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    if let Some(content_type) = &entry.content_type {
        builder.insert_header((header::CONTENT_TYPE, content_type.as_str()));
    }
    builder.body(entry.body)
}

/// Buffer a 200 response, store it, and hand back an identical response.
async fn store_response<B>(
    gate: &RequestGate,
    path: &str,
    query: &str,
    ttl: chrono::Duration,
    res: ServiceResponse<B>,
) -> Result<ServiceResponse<BoxBody>, Error>
where
    B: MessageBody + 'static,
{
    let (req, res) = res.into_parts();
    let (res, body) = res.into_parts();
    let bytes = match to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let e: Box<dyn std::error::Error> = e.into();
            return Err(GateError::UnexpectedInternal(format!("reading response body: {}", e)).into());
        }
    };

    let headers: Vec<(String, String)> = res
        .headers()
        .iter()
        .filter(|(name, _)| !HOP_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();
    let content_type = header_str(res.headers(), "content-type").map(str::to_string);

    if let Err(e) = gate
        .cache()
        .store(path, query, res.status().as_u16(), headers, content_type, &bytes, ttl)
        .await
    {
        warn!("Could not cache response for {}: {}", path, e);
    }

    let res = res.set_body(bytes);
    Ok(ServiceResponse::new(req, res).map_into_boxed_body())
}
