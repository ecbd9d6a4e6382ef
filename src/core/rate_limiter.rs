//! Adaptive rate limiting.
//!
//! Derives a client's effective quota for the current window from the base
//! policy, the client's risk score and behaviour, and overall system load.

use crate::models::{ClientRiskProfile, RateLimitConfig};

#[derive(Debug, Clone)]
pub struct AdaptiveLimiter {
    pub high_risk_score: f64,
    pub low_risk_score: f64,
    pub trusted_likelihood: f64,
    pub bot_likelihood: f64,
    pub high_load: f64,
}

impl Default for AdaptiveLimiter {
    fn default() -> Self {
        Self {
            high_risk_score: 50.0,
            low_risk_score: 20.0,
            trusted_likelihood: 0.8,
            bot_likelihood: 0.3,
            high_load: 0.8,
        }
    }
}

impl AdaptiveLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective request quota for the client's current window.
    ///
    /// Non-adaptive policies return `max_requests` untouched so an attacker
    /// cannot loosen them by behaving well.
    pub fn effective_limit(&self, config: &RateLimitConfig, profile: &ClientRiskProfile, system_load: f64) -> u32 {
        if !config.adaptive_scaling {
            return config.max_requests;
        }

        let mut factor = 1.0;
        if profile.risk_score > self.high_risk_score {
            factor *= 0.5;
        } else if profile.risk_score < self.low_risk_score {
            factor *= 1.2;
        }
        let likelihood = profile.behavior.human_likelihood;
        if likelihood > self.trusted_likelihood {
            factor *= 1.1;
        } else if likelihood < self.bot_likelihood {
            factor *= 0.6;
        }
        if system_load > self.high_load {
            factor *= 0.7;
        }

        let base = config.max_requests as f64;
        let limit = (base * factor).floor();
        limit.clamp(1.0, base * 2.0) as u32
    }

    /// Requests admitted per window: the effective limit plus the burst allowance
    pub fn admission_threshold(&self, config: &RateLimitConfig, effective_limit: u32) -> u32 {
        effective_limit.saturating_add(config.burst_allowance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn profile(risk: f64, likelihood: f64) -> ClientRiskProfile {
        let mut p = ClientRiskProfile::new("c1", Utc::now());
        p.set_risk_score(risk);
        p.behavior.human_likelihood = likelihood;
        p
    }

    fn adaptive(max_requests: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            adaptive_scaling: true,
            ..RateLimitConfig::api_policy()
        }
    }

    #[test]
    fn test_non_adaptive_policy_is_fixed() {
        let limiter = AdaptiveLimiter::new();
        let auth = RateLimitConfig::auth_policy();
        assert_eq!(limiter.effective_limit(&auth, &profile(90.0, 0.05), 0.99), auth.max_requests);
        assert_eq!(limiter.effective_limit(&auth, &profile(0.0, 0.95), 0.0), auth.max_requests);
    }

    #[test]
    fn test_low_risk_human_gets_more() {
        let limit = AdaptiveLimiter::new().effective_limit(&adaptive(100), &profile(0.0, 0.9), 0.1);
        // 100 * 1.2 * 1.1
        assert_eq!(limit, 132);
    }

    #[test]
    fn test_neutral_profile_gets_low_risk_bonus_only() {
        let limit = AdaptiveLimiter::new().effective_limit(&adaptive(30), &profile(0.0, 0.5), 0.0);
        assert_eq!(limit, 36);
    }

    #[test]
    fn test_risky_bot_under_load_is_squeezed() {
        let limit = AdaptiveLimiter::new().effective_limit(&adaptive(100), &profile(70.0, 0.1), 0.9);
        // 100 * 0.5 * 0.6 * 0.7 = 21
        assert_eq!(limit, 21);
    }

    #[test]
    fn test_limit_never_below_one() {
        let limit = AdaptiveLimiter::new().effective_limit(&adaptive(2), &profile(70.0, 0.1), 0.9);
        assert_eq!(limit, 1);
    }

    #[test]
    fn test_admission_threshold_adds_burst() {
        let config = RateLimitConfig {
            burst_allowance: 5,
            ..adaptive(10)
        };
        assert_eq!(AdaptiveLimiter::new().admission_threshold(&config, 10), 15);
    }
}
