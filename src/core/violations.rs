//! Violation ledger and temporary blocklist.
//!
//! Each rate limit violation is recorded on the client's profile and turned
//! into a block whose length grows exponentially with the number of
//! violations in the last hour, capped at 24 hours.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::models::{ClientRiskProfile, RateLimitConfig, Severity, ViolationKind, ViolationRecord};
use crate::utils::seconds;

/// Longest block the ledger ever issues
pub const MAX_BLOCK_HOURS: i64 = 24;
/// Violations older than this are pruned from profiles
pub const VIOLATION_RETENTION_HOURS: i64 = 24;
/// Window in which violations count towards escalation
pub const RECENT_VIOLATION_MINUTES: i64 = 60;
/// Exponent cap. Any multiplier >= 1.03 exceeds 24h well before this.
pub const MAX_PENALTY_EXPONENT: i32 = 32;

fn max_block() -> Duration {
    Duration::hours(MAX_BLOCK_HOURS)
}

/// Active block for a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub until: DateTime<Utc>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// Critical escalations are only lifted by an administrator
    pub escalated: bool,
}

/// Result of recording a violation
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationOutcome {
    pub severity: Severity,
    pub recent_violations: usize,
    pub block_duration: Duration,
    pub blocked_until: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ViolationLedger {
    blocklist: DashMap<String, BlockEntry>,
}

impl ViolationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block duration for a client with `recent` violations in the last hour
    pub fn block_duration(config: &RateLimitConfig, recent: usize) -> Duration {
        let exponent = (recent.max(1) - 1).min(MAX_PENALTY_EXPONENT as usize) as i32;
        let base_ms = seconds(config.block_seconds).num_milliseconds() as f64;
        let millis = base_ms * config.penalty_multiplier.max(1.0).powi(exponent);
        let cap = max_block();
        if !millis.is_finite() || millis >= cap.num_milliseconds() as f64 {
            cap
        } else {
            Duration::milliseconds(millis as i64)
        }
    }

    /// Append a rate limit violation to the profile and block the client
    pub fn record_violation(
        &self,
        profile: &mut ClientRiskProfile,
        config_name: &str,
        config: &RateLimitConfig,
        observed_count: usize,
        limit: u32,
        now: DateTime<Utc>,
    ) -> ViolationOutcome {
        let severity = if observed_count as u64 > 2 * limit as u64 {
            Severity::High
        } else {
            Severity::Medium
        };

        let mut details = BTreeMap::new();
        details.insert("config".to_string(), serde_json::json!(config_name));
        details.insert("observed_count".to_string(), serde_json::json!(observed_count));
        details.insert("limit".to_string(), serde_json::json!(limit));
        profile.violations.push(ViolationRecord {
            timestamp: now,
            kind: ViolationKind::RateLimit,
            severity,
            details,
        });
        Self::prune(profile, now);

        let recent = profile.violations_since(now - Duration::minutes(RECENT_VIOLATION_MINUTES));
        let block_duration = Self::block_duration(config, recent);
        let blocked_until = now + block_duration;
        self.block(&profile.client_id, blocked_until, "rate limit exceeded", false, now);

        ViolationOutcome {
            severity,
            recent_violations: recent,
            block_duration,
            blocked_until,
        }
    }

    /// Drop violation records older than the retention window
    pub fn prune(profile: &mut ClientRiskProfile, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(VIOLATION_RETENTION_HOURS);
        profile.violations.retain(|v| v.timestamp >= cutoff);
    }

    /// Block the client for the maximum duration. Not lifted by later,
    /// shorter blocks.
    pub fn escalate(&self, profile: &mut ClientRiskProfile, now: DateTime<Utc>) -> BlockEntry {
        profile.escalated = true;
        let until = now + max_block();
        warn!("Escalating client {} to a critical block until {}", profile.client_id, until);
        self.block(&profile.client_id, until, "critical threat", true, now)
    }

    /// Insert or extend a block. An existing longer block or an escalated
    /// block is never shortened.
    pub fn block(
        &self,
        client_id: &str,
        until: DateTime<Utc>,
        reason: &str,
        escalated: bool,
        now: DateTime<Utc>,
    ) -> BlockEntry {
        let mut entry = self
            .blocklist
            .entry(client_id.to_string())
            .or_insert_with(|| BlockEntry {
                until,
                reason: reason.to_string(),
                created_at: now,
                escalated,
            });
        let keep_existing = entry.until > now && ((entry.escalated && !escalated) || entry.until > until);
        if !keep_existing {
            *entry = BlockEntry {
                until,
                reason: reason.to_string(),
                created_at: now,
                escalated,
            };
        }
        entry.clone()
    }

    /// The client's block if it is still in force
    pub fn active_block(&self, client_id: &str, now: DateTime<Utc>) -> Option<BlockEntry> {
        self.blocklist
            .get(client_id)
            .filter(|entry| now < entry.until)
            .map(|entry| entry.clone())
    }

    pub fn is_blocked(&self, client_id: &str, now: DateTime<Utc>) -> bool {
        self.active_block(client_id, now).is_some()
    }

    /// Administrative lift of any block, escalated or not
    pub fn unblock(&self, client_id: &str) -> bool {
        self.blocklist.remove(client_id).is_some()
    }

    /// Remove expired blocks, returning the affected client ids
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .blocklist
            .iter()
            .filter(|entry| entry.until <= now)
            .map(|entry| entry.key().clone())
            .collect();
        expired
            .into_iter()
            .filter(|id| self.blocklist.remove_if(id, |_, entry| entry.until <= now).is_some())
            .collect()
    }

    pub fn active_count(&self, now: DateTime<Utc>) -> usize {
        self.blocklist.iter().filter(|entry| now < entry.until).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn policy(block_seconds: u64, penalty_multiplier: f64) -> RateLimitConfig {
        RateLimitConfig {
            block_seconds,
            penalty_multiplier,
            ..RateLimitConfig::default_policy()
        }
    }

    #[test]
    fn test_penalty_escalation() {
        let config = policy(300, 2.0);
        assert_eq!(ViolationLedger::block_duration(&config, 1), Duration::minutes(5));
        assert_eq!(ViolationLedger::block_duration(&config, 2), Duration::minutes(10));
        assert_eq!(ViolationLedger::block_duration(&config, 3), Duration::minutes(20));
    }

    #[test]
    fn test_block_duration_caps_at_a_day() {
        let config = policy(300, 2.0);
        assert_eq!(ViolationLedger::block_duration(&config, 12), Duration::hours(24));
        assert_eq!(ViolationLedger::block_duration(&config, 10_000), Duration::hours(24));
        let huge = policy(300, 1e300);
        assert_eq!(ViolationLedger::block_duration(&huge, 500), Duration::hours(24));
    }

    #[test]
    fn test_three_violations_in_an_hour_block_for_twenty_minutes() {
        let ledger = ViolationLedger::new();
        let config = policy(300, 2.0);
        let mut profile = ClientRiskProfile::new("c1", t0());
        let mut last = None;
        for minute in [0, 10, 20] {
            let now = t0() + Duration::minutes(minute);
            last = Some(ledger.record_violation(&mut profile, "default", &config, 70, 60, now));
        }
        let outcome = last.unwrap();
        assert_eq!(outcome.recent_violations, 3);
        assert_eq!(outcome.block_duration, Duration::minutes(20));
        assert_eq!(outcome.blocked_until, t0() + Duration::minutes(40));
        assert!(ledger.is_blocked("c1", t0() + Duration::minutes(39)));
        assert!(!ledger.is_blocked("c1", t0() + Duration::minutes(40)));
    }

    #[test]
    fn test_severity_depends_on_overshoot() {
        let ledger = ViolationLedger::new();
        let config = policy(60, 2.0);
        let mut profile = ClientRiskProfile::new("c1", t0());
        assert_eq!(ledger.record_violation(&mut profile, "default", &config, 61, 60, t0()).severity, Severity::Medium);
        assert_eq!(ledger.record_violation(&mut profile, "default", &config, 121, 60, t0()).severity, Severity::High);
    }

    #[test]
    fn test_old_violations_are_pruned() {
        let ledger = ViolationLedger::new();
        let config = policy(60, 2.0);
        let mut profile = ClientRiskProfile::new("c1", t0());
        ledger.record_violation(&mut profile, "default", &config, 61, 60, t0());
        let outcome = ledger.record_violation(&mut profile, "default", &config, 61, 60, t0() + Duration::hours(25));
        assert_eq!(profile.violations.len(), 1);
        assert_eq!(outcome.recent_violations, 1);
    }

    #[test]
    fn test_escalated_block_is_not_shortened() {
        let ledger = ViolationLedger::new();
        let mut profile = ClientRiskProfile::new("c1", t0());
        let escalated = ledger.escalate(&mut profile, t0());
        assert!(profile.escalated);
        assert_eq!(escalated.until, t0() + Duration::hours(24));

        ledger.block("c1", t0() + Duration::minutes(1), "rate limit exceeded", false, t0());
        let active = ledger.active_block("c1", t0() + Duration::hours(2)).unwrap();
        assert!(active.escalated);

        assert!(ledger.unblock("c1"));
        assert!(!ledger.is_blocked("c1", t0() + Duration::hours(2)));
    }

    #[test]
    fn test_sweep_expired() {
        let ledger = ViolationLedger::new();
        ledger.block("a", t0() + Duration::minutes(1), "rate limit exceeded", false, t0());
        ledger.block("b", t0() + Duration::minutes(10), "rate limit exceeded", false, t0());
        let removed = ledger.sweep_expired(t0() + Duration::minutes(5));
        assert_eq!(removed, vec!["a".to_string()]);
        assert_eq!(ledger.active_count(t0() + Duration::minutes(5)), 1);
    }
}
