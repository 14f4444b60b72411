pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

pub use handlers::AppState;

/// Correlation id assigned to every request; echoed as `x-request-id`
/// and threaded into error bodies and logs.
#[derive(Clone)]
pub struct RequestId(pub String);

/// Build the application router.
///
/// The rate limiter wraps only the token endpoints; health probes must
/// stay reachable when a client is throttled. The request-id layer wraps
/// everything.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tokens", post(handlers::mint_token))
        .route("/tokens/redeem", post(handlers::redeem_token))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::ratelimit::middleware::enforce,
        ))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .layer(middleware::from_fn(assign_request_id))
        .with_state(state)
}

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
