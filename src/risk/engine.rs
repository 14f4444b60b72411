//! Deterministic risk scorer.
//!
//! A pure function over the gathered context: no I/O, no state, no
//! randomness. Identical inputs always produce the identical score,
//! decision and reasons, which is what makes decisions replayable for
//! audit.

use serde::Serialize;

/// Scores strictly above this reject outright.
pub const REJECT_THRESHOLD: f64 = 0.7;
/// Scores at or above this (and at or below the reject threshold)
/// challenge.
pub const CHALLENGE_THRESHOLD: f64 = 0.3;

/// Historical signals for one account, assembled by the gatherer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskContext {
    /// Tokens minted for the account in the last 10 minutes.
    pub velocity_10m: u64,
    /// Mean amount of the account's successful withdrawals, if any.
    pub avg_amount: Option<f64>,
    /// Non-SUCCESS redemption attempts against the account's tokens in
    /// the last 24 hours.
    pub failed_attempts_24h: u64,
    /// IP recorded on the most recent successful redemption, if any.
    pub last_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskDecision {
    Approve,
    Challenge,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub decision: RiskDecision,
    pub reasons: Vec<String>,
}

/// Score a prospective redemption.
///
/// Contributions are additive and capped at 1.0; the score is rounded to
/// two decimals before the thresholds apply (the contribution table only
/// produces two-decimal sums, so rounding exists to absorb float error,
/// not to change outcomes). Bucket upper bounds are strict-greater: a
/// value sitting exactly on a boundary falls into the lower bucket.
pub fn assess(context: &RiskContext, current_amount: i64, current_ip: Option<&str>) -> RiskAssessment {
    let mut score: f64 = 0.0;
    let mut reasons = Vec::new();

    if context.velocity_10m > 3 {
        score += 0.40;
        reasons.push("high velocity".to_string());
    } else if context.velocity_10m > 1 {
        score += 0.15;
        reasons.push("elevated velocity".to_string());
    }

    // Deviation is undefined without a prior successful average.
    if let Some(avg) = context.avg_amount {
        if avg > 0.0 {
            let deviation = (current_amount as f64 - avg).abs() / avg;
            if deviation > 2.0 {
                score += 0.30;
                reasons.push("significant amount deviation".to_string());
            } else if deviation > 1.0 {
                score += 0.15;
                reasons.push("moderate amount deviation".to_string());
            }
        }
    }

    if context.failed_attempts_24h > 5 {
        score += 0.50;
        reasons.push("excessive failed attempts".to_string());
    } else if context.failed_attempts_24h > 2 {
        score += 0.25;
        reasons.push("elevated failed attempts".to_string());
    }

    if let (Some(last), Some(current)) = (context.last_ip.as_deref(), current_ip) {
        if last != current {
            score += 0.20;
            reasons.push("ip mismatch".to_string());
        }
    }

    let score = round2(score.min(1.0));
    RiskAssessment {
        score,
        decision: decision_for(score),
        reasons,
    }
}

/// Map a (rounded) score onto a decision. Thresholds are strict as
/// written: exactly 0.3 and exactly 0.7 both challenge.
pub fn decision_for(score: f64) -> RiskDecision {
    if score > REJECT_THRESHOLD {
        RiskDecision::Reject
    } else if score >= CHALLENGE_THRESHOLD {
        RiskDecision::Challenge
    } else {
        RiskDecision::Approve
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_context() -> RiskContext {
        RiskContext::default()
    }

    #[test]
    fn clean_history_approves_at_zero() {
        let assessment = assess(&clean_context(), 100, Some("1.1.1.1"));
        assert_eq!(assessment.score, 0.0);
        assert_eq!(assessment.decision, RiskDecision::Approve);
        assert!(assessment.reasons.is_empty());
    }

    #[test]
    fn velocity_buckets_are_strict_on_the_upper_bound() {
        let mut context = clean_context();

        context.velocity_10m = 1;
        assert_eq!(assess(&context, 100, None).score, 0.0);

        context.velocity_10m = 2;
        let a = assess(&context, 100, None);
        assert_eq!(a.score, 0.15);
        assert_eq!(a.reasons, vec!["elevated velocity"]);

        context.velocity_10m = 3;
        assert_eq!(assess(&context, 100, None).score, 0.15);

        context.velocity_10m = 4;
        let a = assess(&context, 100, None);
        assert_eq!(a.score, 0.40);
        assert_eq!(a.reasons, vec!["high velocity"]);
    }

    #[test]
    fn deviation_ties_fall_into_the_lower_bucket() {
        let mut context = clean_context();
        context.avg_amount = Some(100.0);

        // |200-100|/100 = 1.0 exactly: below the moderate bucket.
        assert_eq!(assess(&context, 200, None).score, 0.0);
        // 1.5: moderate.
        assert_eq!(assess(&context, 250, None).score, 0.15);
        // 2.0 exactly: still moderate.
        assert_eq!(assess(&context, 300, None).score, 0.15);
        // 2.5: significant.
        assert_eq!(assess(&context, 350, None).score, 0.30);
    }

    #[test]
    fn no_prior_average_contributes_nothing() {
        let mut context = clean_context();
        context.avg_amount = None;
        assert_eq!(assess(&context, 1_000_000, None).score, 0.0);
        context.avg_amount = Some(0.0);
        assert_eq!(assess(&context, 1_000_000, None).score, 0.0);
    }

    #[test]
    fn failed_attempt_buckets() {
        let mut context = clean_context();

        context.failed_attempts_24h = 2;
        assert_eq!(assess(&context, 100, None).score, 0.0);

        context.failed_attempts_24h = 3;
        assert_eq!(assess(&context, 100, None).score, 0.25);

        context.failed_attempts_24h = 5;
        assert_eq!(assess(&context, 100, None).score, 0.25);

        context.failed_attempts_24h = 6;
        let a = assess(&context, 100, None);
        assert_eq!(a.score, 0.50);
        assert_eq!(a.reasons, vec!["excessive failed attempts"]);
    }

    #[test]
    fn ip_mismatch_needs_both_sides() {
        let mut context = clean_context();
        context.last_ip = Some("1.1.1.1".to_string());

        assert_eq!(assess(&context, 100, Some("1.1.1.1")).score, 0.0);
        assert_eq!(assess(&context, 100, None).score, 0.0);

        let a = assess(&context, 100, Some("2.2.2.2"));
        assert_eq!(a.score, 0.20);
        assert_eq!(a.reasons, vec!["ip mismatch"]);

        context.last_ip = None;
        assert_eq!(assess(&context, 100, Some("2.2.2.2")).score, 0.0);
    }

    #[test]
    fn score_is_capped_at_one() {
        let context = RiskContext {
            velocity_10m: 4,
            avg_amount: Some(100.0),
            failed_attempts_24h: 6,
            last_ip: Some("1.1.1.1".to_string()),
        };
        // 0.4 + 0.5 + 0.2 = 1.1, capped.
        let a = assess(&context, 100, Some("2.2.2.2"));
        assert_eq!(a.score, 1.0);
        assert_eq!(a.decision, RiskDecision::Reject);
        assert_eq!(a.reasons.len(), 3);
    }

    #[test]
    fn float_error_does_not_push_a_sum_over_a_threshold() {
        // 0.40 + 0.30 sums to 0.7000000000000001 in f64; after rounding
        // it must challenge, not reject.
        let context = RiskContext {
            velocity_10m: 4,
            avg_amount: Some(100.0),
            failed_attempts_24h: 0,
            last_ip: None,
        };
        let a = assess(&context, 350, None);
        assert_eq!(a.score, 0.7);
        assert_eq!(a.decision, RiskDecision::Challenge);
    }

    #[test]
    fn decision_thresholds_are_strict() {
        assert_eq!(decision_for(0.29), RiskDecision::Approve);
        assert_eq!(decision_for(0.3), RiskDecision::Challenge);
        assert_eq!(decision_for(0.5), RiskDecision::Challenge);
        assert_eq!(decision_for(0.7), RiskDecision::Challenge);
        assert_eq!(decision_for(0.70001), RiskDecision::Reject);
        assert_eq!(decision_for(1.0), RiskDecision::Reject);
    }

    #[test]
    fn assessment_is_deterministic() {
        let context = RiskContext {
            velocity_10m: 2,
            avg_amount: Some(80.0),
            failed_attempts_24h: 4,
            last_ip: Some("10.0.0.1".to_string()),
        };
        let a = assess(&context, 200, Some("10.0.0.2"));
        let b = assess(&context, 200, Some("10.0.0.2"));
        assert_eq!(a, b);
    }
}
