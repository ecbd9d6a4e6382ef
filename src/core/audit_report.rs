//! Analytical summary over a range of audit events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::audit::AuditEvent;
use crate::models::Severity;

const RATE_LIMIT_EVENT_THRESHOLD: usize = 20;
const HIGH_EVENT_THRESHOLD: usize = 10;
const TOP_CLIENTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEventCount {
    pub client_id: String,
    pub events: usize,
}

/// Report contents depend only on the events in range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub range: ReportRange,
    pub total_events: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    /// Day (`YYYY-MM-DD`) to per-severity counts
    pub daily_trend: BTreeMap<String, BTreeMap<String, usize>>,
    pub top_clients: Vec<ClientEventCount>,
    pub quarantined: usize,
    pub recommendations: Vec<String>,
}

impl AuditReport {
    pub fn build(start: DateTime<Utc>, end: DateTime<Utc>, events: &[AuditEvent], quarantined: usize) -> Self {
        let mut by_severity = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        let mut by_source = BTreeMap::new();
        let mut daily_trend: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        let mut clients: BTreeMap<String, usize> = BTreeMap::new();

        for event in events {
            *by_severity.entry(event.severity.as_str().to_string()).or_insert(0) += 1;
            *by_type.entry(event.event_type.clone()).or_insert(0) += 1;
            *by_source.entry(event.source.clone()).or_insert(0) += 1;
            *daily_trend
                .entry(event.timestamp.format("%Y-%m-%d").to_string())
                .or_default()
                .entry(event.severity.as_str().to_string())
                .or_insert(0) += 1;
            if let Some(client) = event.metadata.get("client_id").and_then(|v| v.as_str()) {
                *clients.entry(client.to_string()).or_insert(0) += 1;
            }
        }

        let mut top_clients: Vec<ClientEventCount> = clients
            .into_iter()
            .map(|(client_id, events)| ClientEventCount { client_id, events })
            .collect();
        top_clients.sort_by(|a, b| b.events.cmp(&a.events).then_with(|| a.client_id.cmp(&b.client_id)));
        top_clients.truncate(TOP_CLIENTS);

        let recommendations = recommendations(events, quarantined);

        Self {
            range: ReportRange { start, end },
            total_events: events.len(),
            by_severity,
            by_type,
            by_source,
            daily_trend,
            top_clients,
            quarantined,
            recommendations,
        }
    }
}

fn recommendations(events: &[AuditEvent], quarantined: usize) -> Vec<String> {
    let critical = events.iter().filter(|e| e.severity == Severity::Critical).count();
    let high = events.iter().filter(|e| e.severity == Severity::High).count();
    let rate_limited = events.iter().filter(|e| e.event_type.starts_with("rate_limit")).count();
    let ddos = events.iter().filter(|e| e.event_type.starts_with("ddos")).count();

    let mut out = Vec::new();
    if critical > 0 {
        out.push(format!("{} critical events present: immediate action required", critical));
    }
    if rate_limited > RATE_LIMIT_EVENT_THRESHOLD {
        out.push(format!(
            "{} rate limit events: possible brute force or scraping, review the offending clients",
            rate_limited
        ));
    }
    if ddos > 0 {
        out.push("DDoS activity detected: verify upstream mitigation is engaged".to_string());
    }
    if high > HIGH_EVENT_THRESHOLD {
        out.push(format!("{} high severity events: tighten policies for the affected routes", high));
    }
    if quarantined > 0 {
        out.push(format!(
            "{} audit events failed integrity checks: investigate storage access",
            quarantined
        ));
    }
    if out.is_empty() {
        out.push("No significant security issues detected".to_string());
    }
    out
}
