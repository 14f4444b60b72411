mod api;
mod config;
mod crypto;
mod db;
mod error;
mod ratelimit;
mod risk;
mod tokens;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{
    header::{self, HeaderName, HeaderValue},
    Method,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AppState;
use config::Config;
use ratelimit::store::{MemoryWindowStore, RedisWindowStore, WindowStore};

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(event_type = "SYSTEM", error = %err, "configuration error");
            std::process::exit(1);
        }
    };

    let db = match db::init_database(&config).await {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(event_type = "SYSTEM", error = %err, "database initialization failed");
            std::process::exit(1);
        }
    };
    tracing::info!(event_type = "SYSTEM", "database connected");

    let store = match window_store(&config).await {
        Some(store) => store,
        None => {
            tracing::error!(
                event_type = "SECURITY",
                "rate limit store unavailable and fail-closed is set"
            );
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(config, db, store));

    // Background expiry sweep: audit hygiene, never load-bearing for
    // redemption correctness.
    let sweeper = state.tokens.clone();
    let sweep_every = Duration::from_secs(state.config.token_ttl_secs.min(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            if let Err(err) = sweeper.expire_overdue().await {
                tracing::error!(event_type = "SYSTEM", error = %err, "expiry sweep failed");
            }
        }
    });

    let mut app = api::router(state.clone())
        .layer(TraceLayer::new_for_http())
        // Security headers
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ));

    if !state.config.cors_allowed_origins.is_empty() {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        app = app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        );
    }

    let addr: SocketAddr = match format!("{}:{}", state.config.host, state.config.port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(event_type = "SYSTEM", error = %err, "invalid HOST:PORT combination");
            std::process::exit(1);
        }
    };

    tracing::info!(event_type = "SYSTEM", %addr, "cashpoint server starting");
    tracing::info!(event_type = "SYSTEM", "  POST /tokens        - mint a withdrawal token");
    tracing::info!(event_type = "SYSTEM", "  POST /tokens/redeem - redeem at an agent");
    tracing::info!(event_type = "SYSTEM", "  GET  /health        - liveness");
    tracing::info!(event_type = "SYSTEM", "  GET  /ready         - readiness");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(event_type = "SYSTEM", error = %err, "failed to bind listener");
            std::process::exit(1);
        }
    };

    // In-flight redemption transactions commit or roll back before the
    // serve future resolves; pools drop afterwards.
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    match served {
        Ok(()) => tracing::info!(event_type = "SYSTEM", "drained, goodbye"),
        Err(err) => {
            tracing::error!(event_type = "SYSTEM", error = %err, "server error during drain");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cashpoint_server=info,tower_http=info".into());

    // Line-delimited JSON when LOG_FORMAT=json, human-readable otherwise.
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Connect the distributed window store.
///
/// When Redis is unreachable at boot: fail-open falls back to a
/// process-local window store with a SECURITY warning, fail-closed
/// returns None and the process exits.
async fn window_store(config: &Config) -> Option<Arc<dyn WindowStore>> {
    let client = match redis::Client::open(config.redis_url()) {
        Ok(client) => client,
        Err(err) => return fallback_store(config, err),
    };
    match redis::aio::ConnectionManager::new(client).await {
        Ok(manager) => {
            tracing::info!(event_type = "SYSTEM", "redis connected");
            Some(Arc::new(RedisWindowStore::new(manager)))
        }
        Err(err) => fallback_store(config, err),
    }
}

fn fallback_store(config: &Config, err: redis::RedisError) -> Option<Arc<dyn WindowStore>> {
    if config.rate_limit.fail_closed {
        return None;
    }
    tracing::error!(
        event_type = "SECURITY",
        error = %err,
        "redis unreachable, falling back to process-local rate limiting"
    );
    Some(Arc::new(MemoryWindowStore::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!(event_type = "SYSTEM", "shutdown signal received, draining");
}
