//! Behavioural analysis of request timing.
//!
//! Human traffic shows moderate jitter between requests. Scripts are either
//! too regular or, when randomised, too erratic. The coefficient of variation
//! of recent inter-arrival times separates the two.

use std::collections::{HashMap, VecDeque};

use crate::core::history::{RequestHistory, MAX_INTERVALS};
use crate::models::BehaviorPattern;

/// Fewer samples than this yield the neutral prior
pub const MIN_SAMPLES: usize = 5;
pub const NEUTRAL_LIKELIHOOD: f64 = 0.5;
/// Score given to timing that looks machine generated
pub const BOT_LIKELIHOOD: f64 = 0.1;

const MIN_HUMAN_CV: f64 = 0.1;
const MAX_HUMAN_CV: f64 = 2.0;
const PEAK_HUMAN_CV: f64 = 0.65;

/// Likelihood in [0, 1] that the intervals come from a human.
pub fn human_likelihood(intervals: &[f64]) -> f64 {
    if intervals.len() < MIN_SAMPLES {
        return NEUTRAL_LIKELIHOOD;
    }

    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        // every request arrived at the same instant
        return BOT_LIKELIHOOD;
    }
    let variance = intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let cv = variance.sqrt() / mean;

    if cv < MIN_HUMAN_CV || cv > MAX_HUMAN_CV {
        return BOT_LIKELIHOOD;
    }
    (1.0 - (cv - PEAK_HUMAN_CV).abs() / PEAK_HUMAN_CV).clamp(0.0, 1.0)
}

/// Builds a [`BehaviorPattern`] from a client's history
#[derive(Debug, Clone)]
pub struct BehaviorAnalyzer {
    consistency_window: usize,
}

impl Default for BehaviorAnalyzer {
    fn default() -> Self {
        Self {
            consistency_window: MAX_INTERVALS,
        }
    }
}

impl BehaviorAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analyze(&self, history: &RequestHistory) -> BehaviorPattern {
        let intervals = history.intervals();
        let human_likelihood = human_likelihood(&intervals);

        let session_duration_secs = match (history.first(), history.last()) {
            (Some(first), Some(last)) => (last.at - first.at).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        };

        let user_agent_consistency =
            consistency(history.recent(self.consistency_window).map(|e| e.user_agent.as_deref()));
        let geographic_consistency =
            consistency(history.recent(self.consistency_window).map(|e| e.country.as_deref()));

        BehaviorPattern {
            request_intervals: VecDeque::from(intervals),
            human_likelihood,
            session_duration_secs,
            user_agent_consistency,
            geographic_consistency,
        }
    }
}

/// Share of observed values equal to the most common one. 1.0 when nothing was observed.
fn consistency<'a>(values: impl Iterator<Item = Option<&'a str>>) -> f64 {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut observed = 0usize;
    for value in values.flatten() {
        *counts.entry(value).or_default() += 1;
        observed += 1;
    }
    match counts.values().max() {
        Some(&top) if observed > 0 => top as f64 / observed as f64,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::history::RequestEntry;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_too_few_samples_is_neutral() {
        assert_eq!(human_likelihood(&[]), 0.5);
        assert_eq!(human_likelihood(&[100.0, 250.0, 90.0, 400.0]), 0.5);
    }

    #[test]
    fn test_regular_intervals_look_like_a_bot() {
        let score = human_likelihood(&[100.0, 100.0, 100.0, 100.0, 100.0]);
        assert!(score <= 0.1);
    }

    #[test]
    fn test_simultaneous_requests_look_like_a_bot() {
        assert_eq!(human_likelihood(&[0.0; 10]), BOT_LIKELIHOOD);
    }

    #[test]
    fn test_erratic_intervals_look_like_a_bot() {
        // one huge gap among tiny ones: cv well above 2
        let score = human_likelihood(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 5000.0]);
        assert_eq!(score, BOT_LIKELIHOOD);
    }

    #[test]
    fn test_human_jitter_scores_high() {
        // cv ~= 0.71
        let score = human_likelihood(&[20.0, 180.0, 50.0, 150.0, 30.0, 120.0, 40.0]);
        assert!(score > 0.6, "score was {}", score);
    }

    #[test]
    fn test_moderate_jitter_stays_out_of_the_bot_band() {
        // cv ~= 0.29
        let score = human_likelihood(&[80.0, 140.0, 60.0, 110.0, 95.0, 130.0, 70.0]);
        assert!(score > 0.3 && score < 0.6, "score was {}", score);
    }

    #[test]
    fn test_peak_is_at_cv_065() {
        // two values a ± d have cv = d / a
        let at_peak = human_likelihood(&[35.0, 165.0, 35.0, 165.0, 35.0, 165.0]);
        assert!((at_peak - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_analyze_consistency_signals() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut history = RequestHistory::new(100);
        for i in 0..4 {
            history.record(RequestEntry {
                at: t0 + Duration::seconds(i * 10),
                user_agent: Some(if i == 3 { "curl/8.0" } else { "Mozilla/5.0" }.to_string()),
                country: None,
            });
        }
        let pattern = BehaviorAnalyzer::new().analyze(&history);
        assert_eq!(pattern.user_agent_consistency, 0.75);
        assert_eq!(pattern.geographic_consistency, 1.0);
        assert_eq!(pattern.session_duration_secs, 30.0);
        assert_eq!(pattern.request_intervals.len(), 3);
        assert_eq!(pattern.human_likelihood, NEUTRAL_LIKELIHOOD);
    }
}
