//! Per-client request log used for sliding-window counts and timing analysis.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::models::RequestContext;

/// How long request entries are retained
pub const HISTORY_RETENTION_HOURS: i64 = 24;
/// Inter-arrival intervals kept for behaviour analysis
pub const MAX_INTERVALS: usize = 20;

/// Metadata key carrying the caller's country, used for geographic consistency
pub const COUNTRY_METADATA_KEY: &str = "country";

#[derive(Debug, Clone, PartialEq)]
pub struct RequestEntry {
    pub at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
}

impl RequestEntry {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            user_agent: None,
            country: None,
        }
    }

    pub fn from_context(at: DateTime<Utc>, ctx: &RequestContext) -> Self {
        Self {
            at,
            user_agent: ctx.user_agent.clone(),
            country: ctx.metadata.get(COUNTRY_METADATA_KEY).cloned(),
        }
    }
}

/// Append-only timestamp log with a 24h retention window and a hard size cap
#[derive(Debug, Clone)]
pub struct RequestHistory {
    entries: VecDeque<RequestEntry>,
    max_entries: usize,
}

impl RequestHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(MAX_INTERVALS + 1),
        }
    }

    /// Append an entry. An entry older than the newest one is moved up to it,
    /// so the log stays in time order if the clock steps backwards.
    pub fn record(&mut self, mut entry: RequestEntry) {
        if let Some(newest) = self.entries.back() {
            entry.at = entry.at.max(newest.at);
        }
        let now = entry.at;
        self.entries.push_back(entry);
        self.prune(now);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Drop entries older than the retention window
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(HISTORY_RETENTION_HOURS);
        while self.entries.front().map_or(false, |e| e.at < cutoff) {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries at or after `since`. Entries are appended in time order, so
    /// the scan stops at the first older entry.
    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.entries.iter().rev().take_while(|e| e.at >= since).count()
    }

    /// Oldest entry at or after `since`
    pub fn oldest_since(&self, since: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .rev()
            .take_while(|e| e.at >= since)
            .last()
            .map(|e| e.at)
    }

    /// The most recent inter-arrival durations in milliseconds, oldest first
    pub fn intervals(&self) -> Vec<f64> {
        let skip = self.entries.len().saturating_sub(MAX_INTERVALS + 1);
        let recent: Vec<&RequestEntry> = self.entries.iter().skip(skip).collect();
        recent
            .windows(2)
            .map(|pair| (pair[1].at - pair[0].at).num_milliseconds().max(0) as f64)
            .collect()
    }

    pub fn first(&self) -> Option<&RequestEntry> {
        self.entries.front()
    }

    pub fn last(&self) -> Option<&RequestEntry> {
        self.entries.back()
    }

    /// The last `n` entries, newest first
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &RequestEntry> {
        self.entries.iter().rev().take(n)
    }
}
