//! Token lifecycle service: minting and transactional single-use
//! redemption.
//!
//! The service is the only writer of token rows. Ledger rows are written
//! only inside the redemption transaction; the unique `token_id` index on
//! the ledger plus the guarded `status='ACTIVE'` update make redemption
//! linearizable per token.

use chrono::{Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    IsolationLevel, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use secrecy::SecretString;
use uuid::Uuid;

use crate::crypto;
use crate::db::entities::redemption_attempt::{self, AttemptResult};
use crate::db::entities::token::{self, TokenStatus};
use crate::db::entities::transaction::{self, TransactionStatus, TransactionType};
use crate::error::ServiceError;

/// Mint retries after a `token_hash` unique-constraint collision.
const MINT_ATTEMPTS: u32 = 3;

/// Hard cap on a prefix candidate scan. Random 4-char prefixes keep the
/// live set per prefix tiny; hitting the cap is a signal worth logging.
const MAX_PREFIX_CANDIDATES: u64 = 32;

/// A freshly minted token. `plaintext` exists in memory only and must
/// never be logged or persisted.
#[derive(Debug)]
pub struct MintedToken {
    pub id: String,
    pub plaintext: String,
    pub amount: i64,
    pub expires_at: chrono::DateTime<Utc>,
}

/// Terminal outcome of a redemption attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    Success {
        token_id: String,
        transaction_id: String,
    },
    /// Malformed, unknown, or hash mismatch.
    Invalid,
    /// Token exists but is USED or EXPIRED. The protocol fuses the two;
    /// the attempt row keeps them distinct.
    ExpiredOrUsed,
}

#[derive(Clone)]
pub struct TokenService {
    db: DatabaseConnection,
    pepper: SecretString,
    ttl: Duration,
}

impl TokenService {
    pub fn new(db: DatabaseConnection, pepper: SecretString, ttl_secs: u64) -> Self {
        Self {
            db,
            pepper,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Mint a withdrawal token for `account_id`.
    ///
    /// Retries from scratch on a `token_hash` collision (vanishingly
    /// rare) up to [`MINT_ATTEMPTS`] times, then fails `Internal`.
    pub async fn mint(&self, account_id: &str, amount: i64) -> Result<MintedToken, ServiceError> {
        if Uuid::parse_str(account_id).is_err() {
            return Err(ServiceError::invalid_argument(
                "accountId must be a valid uuid",
            ));
        }
        if amount <= 0 {
            return Err(ServiceError::invalid_argument(
                "amount must be a positive integer",
            ));
        }

        for attempt in 1..=MINT_ATTEMPTS {
            let plaintext = crypto::generate_plaintext();
            let (prefix, _) = crypto::parse_token(&plaintext)
                .ok_or_else(|| ServiceError::internal("generated token failed self-parse"))?;
            let salt = crypto::generate_salt();
            let hash = crypto::token_hash(&self.pepper, &plaintext, &salt);
            let now = Utc::now();

            let row = token::ActiveModel {
                id: Set(Uuid::new_v4().to_string()),
                account_id: Set(account_id.to_string()),
                amount: Set(amount),
                token_hash: Set(hex::encode(hash)),
                salt: Set(hex::encode(salt)),
                prefix: Set(prefix.to_string()),
                status: Set(TokenStatus::Active),
                expires_at: Set(now + self.ttl),
                used_at: Set(None),
                created_at: Set(now),
            };

            match row.insert(&self.db).await {
                Ok(inserted) => {
                    tracing::info!(
                        event_type = "BUSINESS",
                        token_id = %inserted.id,
                        "withdrawal token minted"
                    );
                    return Ok(MintedToken {
                        id: inserted.id,
                        plaintext,
                        amount,
                        expires_at: inserted.expires_at,
                    });
                }
                Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    tracing::warn!(
                        event_type = "SYSTEM",
                        attempt,
                        "token hash collision, re-minting"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(ServiceError::internal(
            "token minting exhausted collision retries",
        ))
    }

    /// Redeem a presented token inside a single database transaction.
    ///
    /// A malformed token is rejected before any database access. The
    /// candidate scan runs by prefix alone so that tokens already USED or
    /// EXPIRED still answer `ExpiredOrUsed` rather than `Invalid`; the
    /// live-path re-verification happens under a row lock.
    pub async fn redeem(
        &self,
        full_token: &str,
        agent_id: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<RedeemOutcome, ServiceError> {
        let Some((prefix, _core)) = crypto::parse_token(full_token) else {
            return Ok(RedeemOutcome::Invalid);
        };

        let backend = self.db.get_database_backend();
        // SQLite serializes writers; REPEATABLE READ and FOR UPDATE exist
        // on the Postgres path only, and the guarded update below is the
        // correctness anchor on both.
        let txn = if backend == DbBackend::Postgres {
            self.db
                .begin_with_config(Some(IsolationLevel::RepeatableRead), None)
                .await?
        } else {
            self.db.begin().await?
        };
        let now = Utc::now();

        let candidates = token::Entity::find()
            .filter(token::Column::Prefix.eq(prefix))
            .order_by_desc(token::Column::CreatedAt)
            .limit(MAX_PREFIX_CANDIDATES)
            .all(&txn)
            .await?;
        if candidates.len() as u64 == MAX_PREFIX_CANDIDATES {
            tracing::warn!(
                event_type = "SECURITY",
                prefix,
                "prefix candidate scan hit its cap"
            );
        }

        let mut matched: Option<token::Model> = None;
        for candidate in candidates {
            let salt = hex::decode(&candidate.salt)
                .map_err(|_| ServiceError::internal("corrupt salt encoding"))?;
            let stored = hex::decode(&candidate.token_hash)
                .map_err(|_| ServiceError::internal("corrupt hash encoding"))?;
            let computed = crypto::token_hash(&self.pepper, full_token, &salt);
            if crypto::hashes_match(&computed, &stored) {
                matched = Some(candidate);
                break;
            }
        }

        let Some(found) = matched else {
            record_attempt(&txn, None, agent_id, AttemptResult::Invalid, metadata).await?;
            txn.commit().await?;
            tracing::warn!(
                event_type = "SECURITY",
                agent_id,
                "redemption attempt with unknown token"
            );
            return Ok(RedeemOutcome::Invalid);
        };

        if found.status != TokenStatus::Active {
            let result = match found.status {
                TokenStatus::Used => AttemptResult::Used,
                _ => AttemptResult::Expired,
            };
            record_attempt(&txn, Some(&found.id), agent_id, result, metadata).await?;
            txn.commit().await?;
            return Ok(RedeemOutcome::ExpiredOrUsed);
        }

        // Exclusive row lock, then re-verify: another redemption may have
        // won between the scan and here.
        let mut lock_query = token::Entity::find_by_id(found.id.clone());
        if backend == DbBackend::Postgres {
            lock_query = lock_query.lock_exclusive();
        }
        let locked = lock_query
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::internal("token row vanished under lock"))?;

        if locked.status != TokenStatus::Active {
            let result = match locked.status {
                TokenStatus::Used => AttemptResult::Used,
                _ => AttemptResult::Expired,
            };
            record_attempt(&txn, Some(&locked.id), agent_id, result, metadata).await?;
            txn.commit().await?;
            return Ok(RedeemOutcome::ExpiredOrUsed);
        }

        // Strict expiry: a token presented at exactly expires_at is dead.
        if locked.expires_at <= now {
            token::Entity::update_many()
                .col_expr(token::Column::Status, Expr::value(TokenStatus::Expired))
                .filter(token::Column::Id.eq(locked.id.clone()))
                .filter(token::Column::Status.eq(TokenStatus::Active))
                .exec(&txn)
                .await?;
            record_attempt(
                &txn,
                Some(&locked.id),
                agent_id,
                AttemptResult::Expired,
                metadata,
            )
            .await?;
            txn.commit().await?;
            return Ok(RedeemOutcome::ExpiredOrUsed);
        }

        // Optimistic guard: the transition only happens if the row is
        // still ACTIVE at update time.
        let transition = token::Entity::update_many()
            .col_expr(token::Column::Status, Expr::value(TokenStatus::Used))
            .col_expr(token::Column::UsedAt, Expr::value(Some(now)))
            .filter(token::Column::Id.eq(locked.id.clone()))
            .filter(token::Column::Status.eq(TokenStatus::Active))
            .exec(&txn)
            .await?;
        if transition.rows_affected == 0 {
            record_attempt(
                &txn,
                Some(&locked.id),
                agent_id,
                AttemptResult::Used,
                metadata,
            )
            .await?;
            txn.commit().await?;
            return Ok(RedeemOutcome::ExpiredOrUsed);
        }

        let transaction_id = Uuid::new_v4().to_string();
        transaction::ActiveModel {
            id: Set(transaction_id.clone()),
            account_id: Set(locked.account_id.clone()),
            token_id: Set(locked.id.clone()),
            tx_type: Set(TransactionType::Withdrawal),
            amount: Set(locked.amount),
            status: Set(TransactionStatus::Success),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        record_attempt(
            &txn,
            Some(&locked.id),
            agent_id,
            AttemptResult::Success,
            metadata,
        )
        .await?;

        txn.commit().await?;
        tracing::info!(
            event_type = "BUSINESS",
            token_id = %locked.id,
            transaction_id = %transaction_id,
            agent_id,
            "withdrawal token redeemed"
        );
        Ok(RedeemOutcome::Success {
            token_id: locked.id,
            transaction_id,
        })
    }

    /// Read-only resolution of a presented token to its row, used to feed
    /// the risk gatherer before the redemption transaction. Advisory: the
    /// redemption re-verifies everything under lock.
    pub async fn peek(&self, full_token: &str) -> Result<Option<token::Model>, ServiceError> {
        let Some((prefix, _)) = crypto::parse_token(full_token) else {
            return Ok(None);
        };

        let candidates = token::Entity::find()
            .filter(token::Column::Prefix.eq(prefix))
            .order_by_desc(token::Column::CreatedAt)
            .limit(MAX_PREFIX_CANDIDATES)
            .all(&self.db)
            .await?;

        for candidate in candidates {
            let salt = hex::decode(&candidate.salt)
                .map_err(|_| ServiceError::internal("corrupt salt encoding"))?;
            let stored = hex::decode(&candidate.token_hash)
                .map_err(|_| ServiceError::internal("corrupt hash encoding"))?;
            let computed = crypto::token_hash(&self.pepper, full_token, &salt);
            if crypto::hashes_match(&computed, &stored) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Record an attempt decided at the edge (risk REJECT / CHALLENGE),
    /// outside any redemption transaction.
    pub async fn record_edge_attempt(
        &self,
        token_id: Option<&str>,
        agent_id: &str,
        result: AttemptResult,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), ServiceError> {
        record_attempt(&self.db, token_id, agent_id, result, metadata).await?;
        Ok(())
    }

    /// Flip ACTIVE rows past their expiry to EXPIRED. Audit hygiene only;
    /// redemption never trusts the stored status without checking the
    /// clock.
    pub async fn expire_overdue(&self) -> Result<u64, ServiceError> {
        let swept = token::Entity::update_many()
            .col_expr(token::Column::Status, Expr::value(TokenStatus::Expired))
            .filter(token::Column::Status.eq(TokenStatus::Active))
            .filter(token::Column::ExpiresAt.lte(Utc::now()))
            .exec(&self.db)
            .await?;
        if swept.rows_affected > 0 {
            tracing::info!(
                event_type = "SYSTEM",
                count = swept.rows_affected,
                "expired overdue tokens"
            );
        }
        Ok(swept.rows_affected)
    }
}

/// Insert one attempt evidence row on the given connection.
async fn record_attempt<C: ConnectionTrait>(
    conn: &C,
    token_id: Option<&str>,
    agent_id: &str,
    result: AttemptResult,
    metadata: Option<&serde_json::Value>,
) -> Result<(), sea_orm::DbErr> {
    redemption_attempt::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        token_id: Set(token_id.map(str::to_string)),
        agent_id: Set(agent_id.to_string()),
        result: Set(result),
        metadata: Set(metadata.map(|m| m.to_string())),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;
    Ok(())
}
