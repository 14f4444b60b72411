//! Database entities

pub mod redemption_attempt;
pub mod token;
pub mod transaction;

pub use redemption_attempt::Entity as RedemptionAttempt;
pub use token::Entity as Token;
pub use transaction::Entity as Transaction;
