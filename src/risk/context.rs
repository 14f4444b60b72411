//! Risk context gatherer.
//!
//! Assembles the historical signals the engine scores from the token
//! store. Reads are a plain snapshot; risk is advisory, so no attempt is
//! made to keep them transactionally consistent with the redemption that
//! follows.

use chrono::{Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, FromQueryResult, JoinType, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, RelationTrait,
};

use crate::db::entities::redemption_attempt::{self, AttemptResult};
use crate::db::entities::token;
use crate::db::entities::transaction::{self, TransactionStatus};
use crate::error::ServiceError;
use crate::risk::engine::RiskContext;

const VELOCITY_WINDOW_MINS: i64 = 10;
const FAILURE_WINDOW_HOURS: i64 = 24;

#[derive(FromQueryResult)]
struct AvgAmountRow {
    avg_amount: Option<f64>,
}

#[derive(Clone)]
pub struct RiskGatherer {
    db: DatabaseConnection,
}

impl RiskGatherer {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Snapshot the account's historical signals.
    pub async fn gather(&self, account_id: &str) -> Result<RiskContext, ServiceError> {
        let now = Utc::now();

        let velocity_10m = token::Entity::find()
            .filter(token::Column::AccountId.eq(account_id))
            .filter(token::Column::CreatedAt.gt(now - Duration::minutes(VELOCITY_WINDOW_MINS)))
            .count(&self.db)
            .await?;

        let avg_amount = transaction::Entity::find()
            .select_only()
            .column_as(
                Expr::cust("CAST(AVG(amount) AS DOUBLE PRECISION)"),
                "avg_amount",
            )
            .filter(transaction::Column::AccountId.eq(account_id))
            .filter(transaction::Column::Status.eq(TransactionStatus::Success))
            .into_model::<AvgAmountRow>()
            .one(&self.db)
            .await?
            .and_then(|row| row.avg_amount);

        let failed_attempts_24h = redemption_attempt::Entity::find()
            .join(JoinType::InnerJoin, redemption_attempt::Relation::Token.def())
            .filter(token::Column::AccountId.eq(account_id))
            .filter(redemption_attempt::Column::Result.ne(AttemptResult::Success))
            .filter(
                redemption_attempt::Column::CreatedAt
                    .gt(now - Duration::hours(FAILURE_WINDOW_HOURS)),
            )
            .count(&self.db)
            .await?;

        let last_ip = redemption_attempt::Entity::find()
            .join(JoinType::InnerJoin, redemption_attempt::Relation::Token.def())
            .filter(token::Column::AccountId.eq(account_id))
            .filter(redemption_attempt::Column::Result.eq(AttemptResult::Success))
            .order_by_desc(redemption_attempt::Column::CreatedAt)
            .one(&self.db)
            .await?
            .and_then(|attempt| attempt.metadata)
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|meta| meta.get("ip").and_then(|ip| ip.as_str().map(str::to_string)));

        Ok(RiskContext {
            velocity_10m,
            avg_amount,
            failed_attempts_24h,
            last_ip,
        })
    }
}
