//! Database bootstrap using SeaORM.
//!
//! One portable DDL serves both backends: Postgres in deployments,
//! SQLite (`sqlite::memory:`) in tests. Ids are uuid TEXT, binary values
//! (hashes, salts) are hex TEXT, timestamps TIMESTAMPTZ.

pub mod entities;

use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};

use crate::config::Config;

/// Pool ceiling; every redemption transaction holds exactly one
/// connection for its full duration.
const MAX_CONNECTIONS: u32 = 20;
/// Idle connections are reaped after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-query and pool-acquire deadline.
const DB_DEADLINE: Duration = Duration::from_secs(2);

/// Connect and, when auto-migrate is on, bootstrap the schema.
pub async fn init_database(config: &Config) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(config.database_url.clone());
    options
        .max_connections(MAX_CONNECTIONS)
        .min_connections(1)
        .connect_timeout(DB_DEADLINE)
        .acquire_timeout(DB_DEADLINE)
        .idle_timeout(IDLE_TIMEOUT)
        .sqlx_logging(false);

    let db = Database::connect(options).await?;

    if config.auto_migrate {
        create_tables(&db).await?;
    }

    Ok(db)
}

/// Create all tables and indexes if they don't exist.
pub async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();

    // Tokens table. The plaintext token is never stored; only its salted,
    // peppered SHA-256 (hex) plus the non-secret lookup prefix.
    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS tokens (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            amount BIGINT NOT NULL,
            token_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            prefix TEXT NOT NULL,
            status TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            used_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_hash ON tokens(token_hash)"#.to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        backend,
        r#"CREATE INDEX IF NOT EXISTS idx_tokens_prefix_status ON tokens(prefix, status)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        backend,
        r#"CREATE INDEX IF NOT EXISTS idx_tokens_account ON tokens(account_id)"#.to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        backend,
        r#"CREATE INDEX IF NOT EXISTS idx_tokens_expires ON tokens(expires_at)"#.to_string(),
    ))
    .await?;

    // Withdrawal ledger. Insert-only; the unique token_id index is what
    // makes "at most one ledger row per token" a database guarantee.
    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            token_id TEXT NOT NULL,
            tx_type TEXT NOT NULL,
            amount BIGINT NOT NULL,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_token ON transactions(token_id)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        backend,
        r#"CREATE INDEX IF NOT EXISTS idx_transactions_account_created
           ON transactions(account_id, created_at)"#
            .to_string(),
    ))
    .await?;

    // Redemption attempts: one evidence row per terminal outcome.
    // token_id is NULL when no row could be attributed (unknown token,
    // risk rejection at the edge).
    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS redemption_attempts (
            id TEXT PRIMARY KEY,
            token_id TEXT,
            agent_id TEXT NOT NULL,
            result TEXT NOT NULL,
            metadata TEXT,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"CREATE INDEX IF NOT EXISTS idx_attempts_token ON redemption_attempts(token_id)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        backend,
        r#"CREATE INDEX IF NOT EXISTS idx_attempts_created ON redemption_attempts(created_at)"#
            .to_string(),
    ))
    .await?;

    tracing::info!(event_type = "SYSTEM", "database tables initialized");
    Ok(())
}
