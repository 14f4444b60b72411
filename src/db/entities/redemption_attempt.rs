//! Redemption attempt entity: the evidence trail.
//!
//! Every terminal redemption outcome writes exactly one attempt row.
//! The protocol fuses USED and EXPIRED into one 409 answer, but the
//! attempt row keeps the distinct result for forensics.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "redemption_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// NULL when no token row could be attributed: unknown token, or a
    /// risk rejection recorded at the edge before lookup.
    pub token_id: Option<String>,
    pub agent_id: String,
    pub result: AttemptResult,
    /// JSON document (ip, deviceId, location, accountId for edge rows),
    /// serialized as TEXT for backend portability.
    pub metadata: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptResult {
    #[sea_orm(string_value = "SUCCESS")]
    Success,
    #[sea_orm(string_value = "INVALID")]
    Invalid,
    #[sea_orm(string_value = "USED")]
    Used,
    #[sea_orm(string_value = "EXPIRED")]
    Expired,
    #[sea_orm(string_value = "REJECTED_BY_RISK")]
    RejectedByRisk,
    #[sea_orm(string_value = "CHALLENGED")]
    Challenged,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::token::Entity",
        from = "Column::TokenId",
        to = "super::token::Column::Id"
    )]
    Token,
}

impl Related<super::token::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Token.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
