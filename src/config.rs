//! Runtime configuration, loaded from the environment at startup.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `127.0.0.1` |
//! | `PORT` | Server bind port | `8080` |
//! | `DATABASE_URL` | SeaORM connection URL (Postgres or SQLite) | required |
//! | `REDIS_HOST` | Redis host for the rate limiter | required |
//! | `REDIS_PORT` | Redis port | required |
//! | `REDIS_PASSWORD` | Redis AUTH password | none |
//! | `TOKEN_TTL_SECONDS` | Token lifetime, whole seconds, 60..=86400 | required |
//! | `TOKEN_PEPPER` | Process-wide hash pepper | required in production |
//! | `APP_ENV` | `development`, `staging` or `production` | required |
//! | `LOG_FORMAT` | `json` or `pretty` | `pretty` |
//! | `CORS_ALLOWED_ORIGINS` | Comma-separated origin allow-list | none |
//! | `RATE_LIMIT_WINDOW_MS` | Sliding window size | `60000` |
//! | `RATE_LIMIT_MAX_REQUESTS` | Requests admitted per window | `100` |
//! | `RATE_LIMIT_FAIL_CLOSED` | Refuse traffic when Redis is down | `false` |
//! | `RATE_LIMIT_SKIP_SUCCESSFUL` | Uncount requests that end < 400 | `false` |
//! | `AUTO_MIGRATE` | Create tables/indexes at startup | `true` |

use std::env;

use secrecy::SecretString;
use thiserror::Error;

/// Token TTL lower bound in seconds.
pub const TOKEN_TTL_MIN_SECS: u64 = 60;
/// Token TTL upper bound in seconds (24 hours).
pub const TOKEN_TTL_MAX_SECS: u64 = 86_400;

/// Pepper used outside production when `TOKEN_PEPPER` is unset. Worthless
/// as a secret; production refuses to start without a real one.
const DEV_PEPPER: &str = "cashpoint-development-pepper";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_ms: i64,
    pub max_requests: u64,
    pub fail_closed: bool,
    pub skip_successful: bool,
}

#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<SecretString>,
    pub token_ttl_secs: u64,
    pub pepper: SecretString,
    pub environment: Environment,
    pub log_format: LogFormat,
    pub cors_allowed_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub auto_migrate: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = parse_environment(&require("APP_ENV")?)?;

        let pepper = match env::var("TOKEN_PEPPER") {
            Ok(value) if !value.is_empty() => SecretString::from(value),
            _ if environment == Environment::Production => {
                return Err(ConfigError::Missing("TOKEN_PEPPER"));
            }
            _ => {
                tracing::warn!(
                    event_type = "SYSTEM",
                    "TOKEN_PEPPER unset, using the development pepper"
                );
                SecretString::from(DEV_PEPPER.to_string())
            }
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_number("PORT", &require("PORT")?)?,
            database_url: require("DATABASE_URL")?,
            redis_host: require("REDIS_HOST")?,
            redis_port: parse_number("REDIS_PORT", &require("REDIS_PORT")?)?,
            redis_password: env::var("REDIS_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty())
                .map(SecretString::from),
            token_ttl_secs: parse_token_ttl(&require("TOKEN_TTL_SECONDS")?)?,
            pepper,
            environment,
            log_format: parse_log_format(env::var("LOG_FORMAT").ok().as_deref()),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            rate_limit: RateLimitConfig {
                window_ms: optional_number("RATE_LIMIT_WINDOW_MS", 60_000)?,
                max_requests: optional_number("RATE_LIMIT_MAX_REQUESTS", 100)?,
                fail_closed: parse_bool(env::var("RATE_LIMIT_FAIL_CLOSED").ok().as_deref()),
                skip_successful: parse_bool(env::var("RATE_LIMIT_SKIP_SUCCESSFUL").ok().as_deref()),
            },
            auto_migrate: env::var("AUTO_MIGRATE")
                .ok()
                .as_deref()
                .map(|v| parse_bool(Some(v)))
                .unwrap_or(true),
        })
    }

    /// Redis connection URL assembled from host/port/password.
    pub fn redis_url(&self) -> String {
        use secrecy::ExposeSecret;
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}",
                password.expose_secret(),
                self.redis_host,
                self.redis_port
            ),
            None => format!("redis://{}:{}", self.redis_host, self.redis_port),
        }
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_number<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        name,
        reason: format!("{raw:?} is not a valid number"),
    })
}

fn optional_number<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => parse_number(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_token_ttl(raw: &str) -> Result<u64, ConfigError> {
    let secs: u64 = parse_number("TOKEN_TTL_SECONDS", raw)?;
    if !(TOKEN_TTL_MIN_SECS..=TOKEN_TTL_MAX_SECS).contains(&secs) {
        return Err(ConfigError::Invalid {
            name: "TOKEN_TTL_SECONDS",
            reason: format!("{secs} outside {TOKEN_TTL_MIN_SECS}..={TOKEN_TTL_MAX_SECS}"),
        });
    }
    Ok(secs)
}

fn parse_environment(raw: &str) -> Result<Environment, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "development" | "dev" => Ok(Environment::Development),
        "staging" => Ok(Environment::Staging),
        "production" | "prod" => Ok(Environment::Production),
        other => Err(ConfigError::Invalid {
            name: "APP_ENV",
            reason: format!("unknown environment {other:?}"),
        }),
    }
}

fn parse_log_format(raw: Option<&str>) -> LogFormat {
    match raw {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn parse_bool(raw: Option<&str>) -> bool {
    matches!(raw, Some("true") | Some("1") | Some("yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_bounds_are_enforced() {
        assert!(parse_token_ttl("59").is_err());
        assert_eq!(parse_token_ttl("60").unwrap(), 60);
        assert_eq!(parse_token_ttl("86400").unwrap(), 86_400);
        assert!(parse_token_ttl("86401").is_err());
        assert!(parse_token_ttl("-1").is_err());
        assert!(parse_token_ttl("12.5").is_err());
    }

    #[test]
    fn environment_names_parse() {
        assert_eq!(
            parse_environment("production").unwrap(),
            Environment::Production
        );
        assert_eq!(parse_environment("DEV").unwrap(), Environment::Development);
        assert!(parse_environment("qa").is_err());
    }

    #[test]
    fn bools_default_to_false() {
        assert!(parse_bool(Some("true")));
        assert!(parse_bool(Some("1")));
        assert!(!parse_bool(Some("false")));
        assert!(!parse_bool(None));
    }

    #[test]
    fn log_format_defaults_to_pretty() {
        assert_eq!(parse_log_format(Some("json")), LogFormat::Json);
        assert_eq!(parse_log_format(Some("text")), LogFormat::Pretty);
        assert_eq!(parse_log_format(None), LogFormat::Pretty);
    }
}
