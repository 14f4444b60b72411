//! Pre-redemption risk controls: a deterministic scorer over historical
//! signals, and the read-only gatherer that assembles those signals.

pub mod context;
pub mod engine;

pub use context::RiskGatherer;
pub use engine::{assess, RiskAssessment, RiskContext, RiskDecision};
