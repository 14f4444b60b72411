//! Withdrawal token entity.
//!
//! Tokens are stored with their salted, peppered SHA-256 hash (never the
//! raw token) plus the 4-char lookup prefix. The raw token is shown to
//! the caller exactly once at mint time.
//!
//! Status machine: ACTIVE → USED (successful redemption) or
//! ACTIVE → EXPIRED (observed past expiry). USED and EXPIRED are terminal.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub account_id: String,
    /// Withdrawal amount in minor currency units, always positive.
    pub amount: i64,
    /// Hex SHA-256 of pepper ‖ plaintext ‖ salt. Unique index.
    pub token_hash: String,
    /// Hex-encoded 16-byte per-token salt.
    pub salt: String,
    /// First 4 token symbols; non-secret lookup discriminator, never an
    /// authentication input.
    pub prefix: String,
    pub status: TokenStatus,
    pub expires_at: DateTimeUtc,
    /// Set exactly when status becomes USED.
    pub used_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    #[sea_orm(string_value = "ACTIVE")]
    Active,
    #[sea_orm(string_value = "USED")]
    Used,
    #[sea_orm(string_value = "EXPIRED")]
    Expired,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::redemption_attempt::Entity")]
    RedemptionAttempt,
    #[sea_orm(has_one = "super::transaction::Entity")]
    Transaction,
}

impl Related<super::redemption_attempt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RedemptionAttempt.def()
    }
}

impl Related<super::transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transaction.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
