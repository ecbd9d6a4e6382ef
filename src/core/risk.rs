//! Risk scoring.
//!
//! The score is additive and saturates at 100. It depends only on the current
//! profile, history size and external signals, never on call order.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ClientRiskProfile;

/// Signals supplied from outside the engine's own observations
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalSignals {
    pub is_known_malicious_ip: bool,
}

#[derive(Debug, Clone)]
pub struct RiskScorer {
    /// History length above which volume adds risk
    pub high_volume_threshold: usize,
    pub high_volume_weight: f64,
    /// Human likelihood below which timing adds risk
    pub bot_likelihood_threshold: f64,
    pub bot_weight: f64,
    /// Added per violation inside `violation_window`
    pub violation_weight: f64,
    pub violation_window: Duration,
    pub malicious_ip_weight: f64,
}

impl Default for RiskScorer {
    fn default() -> Self {
        Self {
            high_volume_threshold: 100,
            high_volume_weight: 10.0,
            bot_likelihood_threshold: 0.3,
            bot_weight: 20.0,
            violation_weight: 15.0,
            violation_window: Duration::hours(1),
            malicious_ip_weight: 50.0,
        }
    }
}

impl RiskScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Risk score in [0, 100]
    pub fn score(
        &self,
        profile: &ClientRiskProfile,
        history_len: usize,
        signals: &ExternalSignals,
        now: DateTime<Utc>,
    ) -> f64 {
        let mut score = 0.0;
        if history_len > self.high_volume_threshold {
            score += self.high_volume_weight;
        }
        if profile.behavior.human_likelihood < self.bot_likelihood_threshold {
            score += self.bot_weight;
        }
        let recent = profile.violations_since(now - self.violation_window);
        score += self.violation_weight * recent as f64;
        if signals.is_known_malicious_ip {
            score += self.malicious_ip_weight;
        }
        score.min(100.0)
    }

    /// Score the profile in place, updating its threat level
    pub fn apply(
        &self,
        profile: &mut ClientRiskProfile,
        history_len: usize,
        signals: &ExternalSignals,
        now: DateTime<Utc>,
    ) {
        let score = self.score(profile, history_len, signals, now);
        profile.set_risk_score(score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Severity, ThreatLevel, ViolationKind, ViolationRecord};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn violation(at: DateTime<Utc>) -> ViolationRecord {
        ViolationRecord {
            timestamp: at,
            kind: ViolationKind::RateLimit,
            severity: Severity::Medium,
            details: BTreeMap::new(),
        }
    }

    #[test]
    fn test_clean_profile_scores_zero() {
        let profile = ClientRiskProfile::new("c1", now());
        assert_eq!(RiskScorer::new().score(&profile, 10, &ExternalSignals::default(), now()), 0.0);
    }

    #[test]
    fn test_components_add_up() {
        let mut profile = ClientRiskProfile::new("c1", now());
        profile.behavior.human_likelihood = 0.1;
        profile.violations.push(violation(now() - Duration::minutes(10)));
        // outside the one hour window
        profile.violations.push(violation(now() - Duration::hours(3)));
        let score = RiskScorer::new().score(&profile, 101, &ExternalSignals::default(), now());
        assert_eq!(score, 10.0 + 20.0 + 15.0);
    }

    #[test]
    fn test_saturates_at_100() {
        let mut profile = ClientRiskProfile::new("c1", now());
        for m in 0..6 {
            profile.violations.push(violation(now() - Duration::minutes(m)));
        }
        let signals = ExternalSignals {
            is_known_malicious_ip: true,
        };
        let scorer = RiskScorer::new();
        assert_eq!(scorer.score(&profile, 500, &signals, now()), 100.0);
        scorer.apply(&mut profile, 500, &signals, now());
        assert_eq!(profile.threat_level, ThreatLevel::Critical);
    }

    #[test]
    fn test_score_is_independent_of_call_order() {
        let mut profile = ClientRiskProfile::new("c1", now());
        profile.violations.push(violation(now()));
        let scorer = RiskScorer::new();
        let signals = ExternalSignals::default();
        let first = scorer.score(&profile, 50, &signals, now());
        scorer.apply(&mut profile, 50, &signals, now());
        scorer.apply(&mut profile, 50, &signals, now());
        assert_eq!(profile.risk_score, first);
    }
}
