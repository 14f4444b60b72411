//! Axum middleware enforcing the sliding-window limit per client IP and
//! route.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use uuid::Uuid;

use super::{RateLimiter, WindowDecision};
use crate::api::{AppState, RequestId};
use crate::error::ServiceError;

/// Enforce the rate limit for the incoming request.
///
/// On store failure the default policy is fail-open: the request goes
/// through and a SECURITY error is logged. `RATE_LIMIT_FAIL_CLOSED=true`
/// refuses instead (429 with a full-window `Retry-After`).
pub async fn enforce(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let limiter = &state.limiter;
    let route = request.uri().path().to_string();
    let ip = client_ip(&request);
    let key = RateLimiter::ip_key(&ip, &route);
    let member = Uuid::new_v4().to_string();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone());
    let now_ms = Utc::now().timestamp_millis();

    match limiter.check(&key, &member, now_ms).await {
        Ok(WindowDecision::Allowed {
            limit,
            remaining,
            reset_ms,
        }) => {
            let mut response = next.run(request).await;
            if limiter.skip_successful() && response.status().as_u16() < 400 {
                if let Err(err) = limiter.forget(&key, &member).await {
                    tracing::warn!(
                        event_type = "SECURITY",
                        error = %err,
                        "failed to uncount successful request"
                    );
                }
            }
            set_limit_headers(&mut response, limit, remaining, reset_ms);
            response
        }
        Ok(WindowDecision::Denied {
            limit,
            retry_after_ms,
            reset_ms,
        }) => {
            tracing::warn!(
                event_type = "SECURITY",
                ip = %ip,
                route = %route,
                request_id = request_id.as_deref(),
                "rate limit exceeded"
            );
            let retry_after_secs = ((retry_after_ms + 999) / 1000).max(1) as u64;
            let mut response = ServiceError::RateLimited { retry_after_secs }
                .to_response(request_id.as_deref());
            set_limit_headers(&mut response, limit, 0, reset_ms);
            response
        }
        Err(err) => {
            tracing::error!(
                event_type = "SECURITY",
                ip = %ip,
                route = %route,
                request_id = request_id.as_deref(),
                error = %err,
                "rate limit store unavailable"
            );
            if limiter.fail_closed() {
                let retry_after_secs = (limiter.window_ms() as u64 + 999) / 1000;
                ServiceError::RateLimited { retry_after_secs }
                    .to_response(request_id.as_deref())
            } else {
                next.run(request).await
            }
        }
    }
}

/// Client address: first `X-Forwarded-For` hop when present (the service
/// sits behind a proxy in deployments), otherwise the peer address.
fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn set_limit_headers(response: &mut Response, limit: u64, remaining: u64, reset_ms: i64) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&(reset_ms / 1000).to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
}
