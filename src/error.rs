//! Service error taxonomy.
//!
//! Every failure carries one of the kinds below and maps to a fixed HTTP
//! status. Only kinds this service actually produces are listed; auth
//! (401) and resource lookup (404) live in outer layers. All kinds are
//! operational except `Internal`, which marks an infrastructure or
//! programmer fault: its detail is logged server-side and the client
//! only ever sees a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{message}")]
    Forbidden {
        message: String,
        reasons: Vec<String>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

/// JSON body for error responses:
/// `{"error":{"message","statusCode","requestId",...}}`.
#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail<'a> {
    message: &'a str,
    status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasons: Option<&'a [String]>,
}

impl ServiceError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the client-facing response, threading the request id into
    /// the body when the caller has one.
    pub fn to_response(&self, request_id: Option<&str>) -> Response {
        let status = self.status();

        // Internal detail stays on the server.
        let message = match self {
            Self::Internal(detail) => {
                tracing::error!(
                    event_type = "ERROR",
                    request_id,
                    status = status.as_u16(),
                    detail = detail.as_str(),
                    "internal error"
                );
                "Internal server error".to_string()
            }
            Self::Timeout(detail) => {
                tracing::error!(
                    event_type = "ERROR",
                    request_id,
                    status = status.as_u16(),
                    detail = detail.as_str(),
                    "operation deadline exceeded"
                );
                detail.clone()
            }
            other => other.to_string(),
        };

        let reasons = match self {
            Self::Forbidden { reasons, .. } => Some(reasons.as_slice()),
            _ => None,
        };

        let body = Json(ErrorBody {
            error: ErrorDetail {
                message: &message,
                status_code: status.as_u16(),
                request_id,
                reasons,
            },
        });

        let mut response = (status, body).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        self.to_response(None)
    }
}

impl From<sea_orm::DbErr> for ServiceError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::Internal(format!("database error: {err}"))
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        Self::Internal(format!("redis error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(
            ServiceError::invalid_argument("bad").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Conflict("used".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::RateLimited {
                retry_after_secs: 30
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ServiceError::timeout("too slow").status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ServiceError::internal("boom").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn internal_detail_never_reaches_the_client() {
        let response =
            ServiceError::internal("connection pool exhausted at 10.0.0.5").to_response(None);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Internal server error"));
        assert!(!text.contains("10.0.0.5"));
    }

    #[tokio::test]
    async fn timeout_answers_504_with_its_message() {
        let response = ServiceError::timeout("redemption deadline exceeded").to_response(None);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["statusCode"], 504);
        assert_eq!(json["error"]["message"], "redemption deadline exceeded");
    }

    #[tokio::test]
    async fn body_carries_request_id_and_reasons() {
        let err = ServiceError::Forbidden {
            message: "redemption rejected by risk policy".into(),
            reasons: vec!["high velocity".into()],
        };
        let response = err.to_response(Some("req-123"));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["requestId"], "req-123");
        assert_eq!(json["error"]["statusCode"], 403);
        assert_eq!(json["error"]["reasons"][0], "high velocity");
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ServiceError::RateLimited {
            retry_after_secs: 42,
        }
        .to_response(None);
        assert_eq!(response.headers()["retry-after"], "42");
    }
}
