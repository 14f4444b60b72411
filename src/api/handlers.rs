//! Request handlers and shared application state.
//!
//! Handlers follow an outer/inner split: the outer fn owns the HTTP
//! response and attaches the request id, the `*_inner` fn does the work
//! and fails with a [`ServiceError`].

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};

use super::RequestId;
use crate::config::Config;
use crate::crypto;
use crate::db::entities::redemption_attempt::AttemptResult;
use crate::error::ServiceError;
use crate::ratelimit::{store::WindowStore, RateLimiter};
use crate::risk::{assess, RiskDecision, RiskGatherer};
use crate::tokens::{RedeemOutcome, TokenService};

/// Whole-redemption deadline; the outer handler gives up after this.
const REDEEM_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

/// Application state shared across handlers.
pub struct AppState {
    pub config: Config,
    pub db: DatabaseConnection,
    pub tokens: TokenService,
    pub risk: RiskGatherer,
    pub limiter: RateLimiter,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, db: DatabaseConnection, store: Arc<dyn WindowStore>) -> Self {
        let tokens = TokenService::new(db.clone(), config.pepper.clone(), config.token_ttl_secs);
        let risk = RiskGatherer::new(db.clone());
        let limiter = RateLimiter::new(store, config.rate_limit.clone());
        Self {
            config,
            db,
            tokens,
            risk,
            limiter,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MintRequest {
    pub account_id: String,
    pub amount: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MintResponse {
    success: bool,
    data: MintData,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MintData {
    id: String,
    /// The plaintext token. Visible here exactly once; it is never
    /// persisted or logged.
    token: String,
    amount: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RedeemRequest {
    pub token: String,
    pub account_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RedeemResponse {
    success: bool,
    message: String,
    transaction_id: String,
}

/// POST /tokens
pub async fn mint_token(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<MintRequest>, JsonRejection>,
) -> Response {
    match mint_inner(&state, payload).await {
        Ok(response) => response,
        Err(err) => err.to_response(Some(&request_id.0)),
    }
}

async fn mint_inner(
    state: &AppState,
    payload: Result<Json<MintRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let Json(request) = payload
        .map_err(|err| ServiceError::invalid_argument(format!("invalid request body: {err}")))?;

    let minted = state.tokens.mint(&request.account_id, request.amount).await?;

    Ok((
        StatusCode::CREATED,
        Json(MintResponse {
            success: true,
            data: MintData {
                id: minted.id,
                token: minted.plaintext,
                amount: minted.amount,
                expires_at: minted.expires_at,
            },
        }),
    )
        .into_response())
}

/// POST /tokens/redeem
pub async fn redeem_token(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<RedeemRequest>, JsonRejection>,
) -> Response {
    match redeem_inner(&state, &request_id, payload).await {
        Ok(response) => response,
        Err(err) => err.to_response(Some(&request_id.0)),
    }
}

async fn redeem_inner(
    state: &AppState,
    request_id: &RequestId,
    payload: Result<Json<RedeemRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let Json(request) = payload
        .map_err(|err| ServiceError::invalid_argument(format!("invalid request body: {err}")))?;

    // Shape checks first; a malformed token never reaches the store.
    if crypto::parse_token(&request.token).is_none() {
        return Err(ServiceError::invalid_argument(
            "token must match ^[A-Z0-9]{4}-[A-Z0-9]{8}$",
        ));
    }
    if uuid::Uuid::parse_str(&request.account_id).is_err() {
        return Err(ServiceError::invalid_argument(
            "accountId must be a valid uuid",
        ));
    }
    if request.agent_id.trim().is_empty() {
        return Err(ServiceError::invalid_argument("agentId must not be empty"));
    }

    // Advisory risk pass. The peek resolves the token read-only so the
    // scorer knows the amount at stake; the redemption transaction
    // re-verifies everything under lock.
    if let Some(peeked) = state.tokens.peek(&request.token).await? {
        // Evidence rows written at the edge carry the account id
        // alongside whatever the agent sent; rows written inside the
        // redemption transaction keep the agent's metadata untouched.
        let mut edge_meta = request
            .metadata
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(object) = edge_meta.as_object_mut() {
            object
                .entry("accountId")
                .or_insert_with(|| serde_json::json!(request.account_id));
        }

        let context = state.risk.gather(&request.account_id).await?;
        let current_ip = request
            .metadata
            .as_ref()
            .and_then(|meta| meta.get("ip"))
            .and_then(|ip| ip.as_str());
        let assessment = assess(&context, peeked.amount, current_ip);

        match assessment.decision {
            RiskDecision::Reject => {
                tracing::warn!(
                    event_type = "SECURITY",
                    request_id = %request_id.0,
                    agent_id = %request.agent_id,
                    score = assessment.score,
                    reasons = ?assessment.reasons,
                    "redemption rejected by risk policy"
                );
                state
                    .tokens
                    .record_edge_attempt(
                        Some(&peeked.id),
                        &request.agent_id,
                        AttemptResult::RejectedByRisk,
                        Some(&edge_meta),
                    )
                    .await?;
                return Err(ServiceError::Forbidden {
                    message: "redemption rejected by risk policy".to_string(),
                    reasons: assessment.reasons,
                });
            }
            RiskDecision::Challenge => {
                tracing::warn!(
                    event_type = "SECURITY",
                    request_id = %request_id.0,
                    agent_id = %request.agent_id,
                    score = assessment.score,
                    reasons = ?assessment.reasons,
                    "redemption challenged by risk policy"
                );
                state
                    .tokens
                    .record_edge_attempt(
                        Some(&peeked.id),
                        &request.agent_id,
                        AttemptResult::Challenged,
                        Some(&edge_meta),
                    )
                    .await?;
                return Err(ServiceError::Forbidden {
                    message: "additional verification required".to_string(),
                    reasons: assessment.reasons,
                });
            }
            RiskDecision::Approve => {}
        }
    }

    let outcome = tokio::time::timeout(
        REDEEM_DEADLINE,
        state
            .tokens
            .redeem(&request.token, &request.agent_id, request.metadata.as_ref()),
    )
    .await
    .map_err(|_| ServiceError::timeout("redemption deadline exceeded"))??;

    match outcome {
        RedeemOutcome::Success { transaction_id, .. } => Ok(Json(RedeemResponse {
            success: true,
            message: "withdrawal approved".to_string(),
            transaction_id,
        })
        .into_response()),
        RedeemOutcome::Invalid => Err(ServiceError::invalid_argument("token is invalid")),
        RedeemOutcome::ExpiredOrUsed => Err(ServiceError::Conflict(
            "token already used or expired".to_string(),
        )),
    }
}

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    uptime: u64,
}

/// GET /health: liveness.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    database: bool,
    cache: bool,
}

/// GET /ready: readiness. Both backing stores must answer.
pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let database = state.db.ping().await.is_ok();
    let cache = state.limiter.ping().await;
    let all_ok = database && cache;

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if all_ok { "ok" } else { "degraded" },
            database,
            cache,
        }),
    )
        .into_response()
}
