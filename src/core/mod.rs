//! Core functionality for the admission service.
//!
//! This module contains the engine components: per-client history and
//! behaviour analysis, risk scoring, adaptive rate limiting, the violation
//! ledger, DDoS detection, the audit log and the background tasks that tie
//! them together.

pub mod admission;
pub mod alerting;
pub mod audit;
pub mod audit_report;
pub mod behavior;
pub mod clock;
pub mod ddos_detector;
pub mod history;
pub mod profiles;
pub mod rate_limiter;
pub mod risk;
pub mod self_log;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod violations;

pub use admission::{AdmissionDecider, Collaborators, EngineError};
pub use alerting::{Alert, AlertSink, BroadcastAlertSink, LogAlertSink, WebhookAlertSink};
pub use audit::{AuditError, AuditEvent, AuditFilter, AuditLog, ExportFormat, QuarantinedRecord};
pub use audit_report::AuditReport;
pub use behavior::{human_likelihood, BehaviorAnalyzer};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use ddos_detector::{DdosDetector, DdosVerdict};
pub use rate_limiter::AdaptiveLimiter;
pub use risk::RiskScorer;
pub use store::{MemoryStore, PersistenceStore, RedisStore, StoreError};
pub use sweeper::{BackgroundTasks, Sweeper};
pub use violations::ViolationLedger;
