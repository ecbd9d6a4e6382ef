//! Rate-limited diagnostics for the audit log's own failures.
//!
//! Every report lands in a small local ring buffer. Only a fraction reach the
//! `log` backend, throttled by a token bucket, and nothing is ever routed back
//! through the audit log.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SelfLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
    /// Whether the entry was also written to the log backend
    pub emitted: bool,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Option<DateTime<Utc>>,
    ring: VecDeque<SelfLogEntry>,
    suppressed: u64,
}

#[derive(Debug)]
pub struct SelfLogger {
    capacity: f64,
    refill_per_sec: f64,
    ring_capacity: usize,
    state: Mutex<Bucket>,
}

impl Default for SelfLogger {
    fn default() -> Self {
        Self::new(5, 0.1, 64)
    }
}

impl SelfLogger {
    pub fn new(capacity: u32, refill_per_sec: f64, ring_capacity: usize) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            ring_capacity: ring_capacity.max(1),
            state: Mutex::new(Bucket {
                tokens: capacity as f64,
                last_refill: None,
                ring: VecDeque::new(),
                suppressed: 0,
            }),
        }
    }

    /// Record a diagnostic. Returns true when it was also logged.
    pub fn report(&self, now: DateTime<Utc>, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut state = self.state.lock();

        if let Some(last) = state.last_refill {
            let elapsed = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        }
        state.last_refill = Some(now);

        let emitted = state.tokens >= 1.0;
        if emitted {
            state.tokens -= 1.0;
            if state.suppressed > 0 {
                warn!("audit: {} ({} similar messages suppressed)", message, state.suppressed);
                state.suppressed = 0;
            } else {
                warn!("audit: {}", message);
            }
        } else {
            state.suppressed += 1;
        }

        if state.ring.len() == self.ring_capacity {
            state.ring.pop_front();
        }
        state.ring.push_back(SelfLogEntry { at: now, message, emitted });
        emitted
    }

    /// Most recent diagnostics, oldest first
    pub fn recent(&self) -> Vec<SelfLogEntry> {
        self.state.lock().ring.iter().cloned().collect()
    }

    pub fn suppressed(&self) -> u64 {
        self.state.lock().suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_bursts_are_throttled() {
        let logger = SelfLogger::new(3, 0.1, 8);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let emitted = (0..20).filter(|i| logger.report(now, format!("flush failed {}", i))).count();
        assert_eq!(emitted, 3);
        assert_eq!(logger.suppressed(), 17);
        // ring keeps only the newest entries
        let recent = logger.recent();
        assert_eq!(recent.len(), 8);
        assert_eq!(recent.last().unwrap().message, "flush failed 19");
    }

    #[test]
    fn test_tokens_refill_over_time() {
        let logger = SelfLogger::new(1, 0.1, 8);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(logger.report(now, "first"));
        assert!(!logger.report(now + Duration::seconds(5), "second"));
        assert!(logger.report(now + Duration::seconds(15), "third"));
        assert_eq!(logger.suppressed(), 0);
    }
}
