//! DDoS detection for the admission service.
//!
//! Aggregates per-client activity snapshots over a trailing window into
//! system-wide metrics and grades them into an attack verdict. The detector is
//! pure: the sweeper collects snapshots under the per-client locks and hands
//! them over, so no lock is held while the verdict is computed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DdosMetrics, ThreatLevel};

/// DDoS detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosDetectionConfig {
    /// Trailing window aggregated on each run (seconds)
    pub window_secs: u64,
    /// Requests per second above which the attack is critical
    pub critical_rps: f64,
    /// Requests per second above which the attack is high
    pub high_rps: f64,
    /// Requests per second above which the attack is medium
    pub medium_rps: f64,
    /// Suspicious client ratio above which the attack is medium
    pub medium_suspicious_ratio: f64,
    /// Suspicious client ratio above which traffic is flagged low
    pub low_suspicious_ratio: f64,
    /// Average response time treated as an attack signal (milliseconds)
    pub latency_threshold_ms: f64,
    /// Request rate treated as full system load
    pub load_capacity_rps: f64,
}

impl Default for DdosDetectionConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            critical_rps: 100.0,
            high_rps: 50.0,
            medium_rps: 20.0,
            medium_suspicious_ratio: 0.3,
            low_suspicious_ratio: 0.1,
            latency_threshold_ms: 5000.0,
            load_capacity_rps: 100.0,
        }
    }
}

/// Activity of a single client inside the detection window
#[derive(Debug, Clone, PartialEq)]
pub struct ClientActivity {
    pub client_id: String,
    pub requests_in_window: usize,
    pub threat_level: ThreatLevel,
}

/// Structured result of a detection run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosVerdict {
    pub is_under_attack: bool,
    pub severity: ThreatLevel,
    pub requests_per_second: f64,
    pub suspicious_ratio: f64,
    pub latency_degraded: bool,
    pub metrics: DdosMetrics,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl DdosVerdict {
    /// Verdict before the first detection run
    pub fn quiet(now: DateTime<Utc>) -> Self {
        Self {
            is_under_attack: false,
            severity: ThreatLevel::None,
            requests_per_second: 0.0,
            suspicious_ratio: 0.0,
            latency_degraded: false,
            metrics: DdosMetrics::default(),
            recommendations: Vec::new(),
            checked_at: now,
        }
    }
}

/// DDoS detector implementation
#[derive(Debug, Clone, Default)]
pub struct DdosDetector {
    config: DdosDetectionConfig,
}

impl DdosDetector {
    /// Create a new DDoS detector instance
    pub fn new(config: DdosDetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DdosDetectionConfig {
        &self.config
    }

    /// Grade the activity of all clients in the trailing window.
    ///
    /// # Arguments
    ///
    /// * `activity` - One entry per known client
    /// * `avg_response_ms` - Average response time observed in the window
    /// * `blocked_requests` - Requests denied by the blocklist since the last run
    pub fn analyze(
        &self,
        activity: &[ClientActivity],
        avg_response_ms: f64,
        blocked_requests: u64,
        now: DateTime<Utc>,
    ) -> DdosVerdict {
        let active: Vec<&ClientActivity> = activity.iter().filter(|c| c.requests_in_window > 0).collect();
        let total_requests: u64 = active.iter().map(|c| c.requests_in_window as u64).sum();
        let unique_clients = active.len() as u64;
        let suspicious_clients = active.iter().filter(|c| c.threat_level != ThreatLevel::None).count() as u64;

        let window = self.config.window_secs.max(1) as f64;
        let requests_per_second = total_requests as f64 / window;
        let suspicious_ratio = if unique_clients == 0 {
            0.0
        } else {
            suspicious_clients as f64 / unique_clients as f64
        };

        let mut severity = self.rate_severity(requests_per_second, suspicious_ratio);
        let latency_degraded = avg_response_ms > self.config.latency_threshold_ms;
        if latency_degraded && severity < ThreatLevel::Medium {
            severity = ThreatLevel::Medium;
        }
        let is_under_attack = latency_degraded || severity >= ThreatLevel::Medium;

        let system_load = if self.config.load_capacity_rps > 0.0 {
            (requests_per_second / self.config.load_capacity_rps).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let metrics = DdosMetrics {
            total_requests,
            unique_clients,
            suspicious_clients,
            blocked_requests,
            avg_response_time: avg_response_ms,
            system_load,
        };

        let recommendations = recommendations(severity, suspicious_ratio, latency_degraded, &active);

        DdosVerdict {
            is_under_attack,
            severity,
            requests_per_second,
            suspicious_ratio,
            latency_degraded,
            metrics,
            recommendations,
            checked_at: now,
        }
    }

    fn rate_severity(&self, rps: f64, suspicious_ratio: f64) -> ThreatLevel {
        if rps > self.config.critical_rps {
            ThreatLevel::Critical
        } else if rps > self.config.high_rps {
            ThreatLevel::High
        } else if rps > self.config.medium_rps || suspicious_ratio > self.config.medium_suspicious_ratio {
            ThreatLevel::Medium
        } else if suspicious_ratio > self.config.low_suspicious_ratio {
            ThreatLevel::Low
        } else {
            ThreatLevel::None
        }
    }
}

fn recommendations(
    severity: ThreatLevel,
    suspicious_ratio: f64,
    latency_degraded: bool,
    active: &[&ClientActivity],
) -> Vec<String> {
    let mut out = Vec::new();
    match severity {
        ThreatLevel::Critical => {
            out.push("Critical request volume: enable upstream DDoS mitigation immediately".to_string());
            out.push("Tighten rate limit policies and consider challenge pages for new clients".to_string());
        }
        ThreatLevel::High => {
            out.push("High request volume: review top clients and tighten rate limits".to_string());
        }
        ThreatLevel::Medium => {
            out.push("Elevated traffic: monitor closely and prepare mitigation".to_string());
        }
        ThreatLevel::Low => {
            out.push("Some suspicious clients detected: review their activity".to_string());
        }
        ThreatLevel::None => {}
    }
    if suspicious_ratio > 0.3 {
        out.push(format!(
            "{:.0}% of active clients are suspicious: consider blocking known bad sources",
            suspicious_ratio * 100.0
        ));
    }
    if latency_degraded {
        out.push("Response times are degraded: check backend capacity and scale if needed".to_string());
    }

    let mut heaviest: Vec<&&ClientActivity> = active.iter().collect();
    heaviest.sort_by(|a, b| b.requests_in_window.cmp(&a.requests_in_window).then(a.client_id.cmp(&b.client_id)));
    if severity >= ThreatLevel::High {
        if let Some(top) = heaviest.first() {
            out.push(format!(
                "Heaviest client {} sent {} requests in the window",
                top.client_id, top.requests_in_window
            ));
        }
    }
    out
}
