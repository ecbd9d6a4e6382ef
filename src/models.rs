use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the fallback policy. Unknown policy names resolve to it.
pub const DEFAULT_POLICY: &str = "default";
/// Policy for general API traffic.
pub const API_POLICY: &str = "api";
/// Policy for authentication attempts. Every decision under it is audited.
pub const AUTH_POLICY: &str = "auth";

/// Named rate limit policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding window length in seconds
    pub window_seconds: u64,
    /// Requests allowed per window before adaptive scaling
    pub max_requests: u32,
    /// Base block duration in seconds after the first violation
    pub block_seconds: u64,
    /// Whether the limit follows the client's risk and behaviour
    pub adaptive_scaling: bool,
    /// Extra requests tolerated on top of the effective limit
    pub burst_allowance: u32,
    /// Growth factor applied to the block duration per recent violation
    pub penalty_multiplier: f64,
}

impl RateLimitConfig {
    pub fn default_policy() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 60,
            block_seconds: 60,
            adaptive_scaling: false,
            burst_allowance: 0,
            penalty_multiplier: 2.0,
        }
    }

    pub fn api_policy() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 30,
            block_seconds: 300,
            adaptive_scaling: true,
            burst_allowance: 10,
            penalty_multiplier: 1.5,
        }
    }

    pub fn auth_policy() -> Self {
        Self {
            window_seconds: 300,
            max_requests: 5,
            block_seconds: 900,
            adaptive_scaling: false,
            burst_allowance: 0,
            penalty_multiplier: 2.0,
        }
    }

    /// Largest window count the policy can ever admit. Adaptive limits are
    /// clamped to twice `max_requests`.
    pub fn peak_threshold(&self) -> u64 {
        let ceiling = if self.adaptive_scaling { 2 } else { 1 };
        ceiling * self.max_requests as u64 + self.burst_allowance as u64
    }

    /// The three policies every engine starts with.
    pub fn builtin() -> HashMap<String, RateLimitConfig> {
        let mut policies = HashMap::new();
        policies.insert(DEFAULT_POLICY.to_string(), Self::default_policy());
        policies.insert(API_POLICY.to_string(), Self::api_policy());
        policies.insert(AUTH_POLICY.to_string(), Self::auth_policy());
        policies
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::default_policy()
    }
}

/// Discrete threat level derived from a risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            ThreatLevel::Critical
        } else if score >= 60.0 {
            ThreatLevel::High
        } else if score >= 40.0 {
            ThreatLevel::Medium
        } else if score >= 20.0 {
            ThreatLevel::Low
        } else {
            ThreatLevel::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

/// Severity of violations, audit events and alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// High and critical events are flushed without waiting for the timer.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl From<ThreatLevel> for Severity {
    fn from(level: ThreatLevel) -> Self {
        match level {
            ThreatLevel::None | ThreatLevel::Low => Severity::Low,
            ThreatLevel::Medium => Severity::Medium,
            ThreatLevel::High => Severity::High,
            ThreatLevel::Critical => Severity::Critical,
        }
    }
}

/// Kind of recorded violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    RateLimit,
    SuspiciousPattern,
    KnownAttack,
    BotDetection,
}

/// A single violation, immutable once created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub details: BTreeMap<String, serde_json::Value>,
}

/// Timing and consistency signals derived from a client's request history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorPattern {
    /// Most recent inter-arrival durations in milliseconds
    pub request_intervals: VecDeque<f64>,
    pub human_likelihood: f64,
    pub session_duration_secs: f64,
    pub user_agent_consistency: f64,
    pub geographic_consistency: f64,
}

impl Default for BehaviorPattern {
    fn default() -> Self {
        Self {
            request_intervals: VecDeque::new(),
            human_likelihood: 0.5,
            session_duration_secs: 0.0,
            user_agent_consistency: 1.0,
            geographic_consistency: 1.0,
        }
    }
}

/// Per-client risk profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRiskProfile {
    pub client_id: String,
    pub risk_score: f64,
    pub threat_level: ThreatLevel,
    pub violations: Vec<ViolationRecord>,
    pub adaptive_limit: u32,
    pub last_activity: DateTime<Utc>,
    pub behavior: BehaviorPattern,
    /// Set once the client has been escalated to a critical block. Keeps the
    /// client blocked, renewing the block as it lapses, until an unblock.
    #[serde(default)]
    pub escalated: bool,
}

impl ClientRiskProfile {
    pub fn new(client_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.to_string(),
            risk_score: 0.0,
            threat_level: ThreatLevel::None,
            violations: Vec::new(),
            adaptive_limit: 0,
            last_activity: now,
            behavior: BehaviorPattern::default(),
            escalated: false,
        }
    }

    /// Number of violations recorded at or after `since`
    pub fn violations_since(&self, since: DateTime<Utc>) -> usize {
        self.violations.iter().filter(|v| v.timestamp >= since).count()
    }

    pub fn set_risk_score(&mut self, score: f64) {
        self.risk_score = score.clamp(0.0, 100.0);
        self.threat_level = ThreatLevel::from_score(self.risk_score);
    }
}

/// Caller-supplied context for an admission check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Set by callers that already know the source is malicious
    #[serde(default)]
    pub known_malicious: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn with_ip(ip: &str) -> Self {
        Self {
            ip_address: Some(ip.to_string()),
            ..Self::default()
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub risk_score: f64,
    pub threat_level: ThreatLevel,
    pub reason: String,
}

/// System-wide traffic snapshot computed by the sweeper
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DdosMetrics {
    pub total_requests: u64,
    pub unique_clients: u64,
    pub suspicious_clients: u64,
    pub blocked_requests: u64,
    /// Average response time in milliseconds
    pub avg_response_time: f64,
    pub system_load: f64,
}

/// Summary entry for the riskiest clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRiskSummary {
    pub client_id: String,
    pub risk_score: f64,
    pub threat_level: ThreatLevel,
    pub violations: usize,
    pub last_activity: DateTime<Utc>,
}

/// Engine statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub total_clients: usize,
    pub active_clients: usize,
    pub blocked_clients: usize,
    pub ddos_metrics: DdosMetrics,
    pub top_risk_clients: Vec<ClientRiskSummary>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

/// Persistence backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `memory` or `redis`
    pub backend: String,
    /// Timeout applied to every persistence call
    pub timeout_ms: u64,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Sweeper interval in seconds
    pub sweep_interval_secs: u64,
    /// Trailing window aggregated by DDoS detection
    pub ddos_window_secs: u64,
    /// Inactivity after which a profile is evicted
    pub profile_ttl_secs: u64,
    /// Activity window used for the active client count
    pub active_window_secs: u64,
    /// Block applied by auto-blocklist maintenance
    pub auto_block_secs: u64,
    /// Request rate treated as full system load
    pub load_capacity_rps: f64,
    /// Number of clients reported in statistics
    pub top_risk_clients: usize,
    /// Hard cap on retained history entries per client
    pub max_history_per_client: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            ddos_window_secs: 300,
            profile_ttl_secs: 7 * 24 * 60 * 60,
            active_window_secs: 300,
            auto_block_secs: 3600,
            load_capacity_rps: 100.0,
            top_risk_clients: 10,
            max_history_per_client: 10_000,
        }
    }
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Periodic flush interval in seconds
    pub flush_interval_secs: u64,
    /// Persisted events kept after each flush
    pub max_events: usize,
    /// Persisted event count above which older events are compacted
    pub compress_threshold: usize,
    /// Upper bound on queued, unflushed events
    pub max_queue: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            flush_interval_secs: 30,
            max_events: 5000,
            compress_threshold: 1000,
            max_queue: 10_000,
        }
    }
}

/// Alert delivery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Webhook receiving alerts as JSON; alerts are only logged when unset
    pub webhook_url: Option<String>,
    /// Webhook request timeout
    pub timeout_ms: u64,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Persistence backend
    pub storage: StorageConfig,
    /// Engine tuning
    pub engine: EngineSettings,
    /// Audit log configuration
    pub audit: AuditSettings,
    /// Alert delivery
    pub alerting: AlertingConfig,
    /// Policies added to or overriding the built-ins
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            storage: StorageConfig {
                backend: "memory".to_string(),
                timeout_ms: 2000,
            },
            engine: EngineSettings::default(),
            audit: AuditSettings::default(),
            alerting: AlertingConfig {
                webhook_url: None,
                timeout_ms: 3000,
            },
            rate_limits: HashMap::new(),
        }
    }
}
