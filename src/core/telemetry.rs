//! Metric names and descriptions.

use metrics::{describe_counter, describe_gauge};

pub const METRIC_REQUESTS: &str = "admission_requests_total";
pub const METRIC_DENIED: &str = "admission_denied_total";
pub const METRIC_BLOCKED: &str = "admission_blocked_total";
pub const METRIC_VIOLATIONS: &str = "admission_violations_total";
pub const METRIC_CLIENTS: &str = "admission_clients";
pub const METRIC_DDOS_RPS: &str = "ddos_requests_per_second";
pub const METRIC_AUDIT_QUEUE_DEPTH: &str = "audit_queue_depth";
pub const METRIC_AUDIT_FLUSH_FAILURES: &str = "audit_flush_failures_total";

/// Register HELP text with the installed recorder
pub fn register_descriptions() {
    describe_counter!(METRIC_REQUESTS, "Admission checks performed");
    describe_counter!(METRIC_DENIED, "Admission checks denied");
    describe_counter!(METRIC_BLOCKED, "Requests denied by an active block");
    describe_counter!(METRIC_VIOLATIONS, "Rate limit violations recorded");
    describe_gauge!(METRIC_CLIENTS, "Tracked client profiles");
    describe_gauge!(METRIC_DDOS_RPS, "Request rate seen by the last DDoS detection run");
    describe_gauge!(METRIC_AUDIT_QUEUE_DEPTH, "Audit events waiting to be flushed");
    describe_counter!(METRIC_AUDIT_FLUSH_FAILURES, "Failed audit flushes");
}
