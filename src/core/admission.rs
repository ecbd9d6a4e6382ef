//! Admission decisions for the admission service.
//!
//! [`AdmissionDecider::check`] is the hot path. It runs under the client's
//! own lock, never touches the persistence collaborator and always returns a
//! [`Decision`]. Everything durable (audit events, profile snapshots) is queued
//! or left to the background tasks.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::validate_policy;
use crate::core::alerting::{Alert, AlertSink, AUTO_BLOCK_LIST_UPDATED, CRITICAL_THREAT_DETECTED, DDOS_ATTACK_DETECTED};
use crate::core::audit::{AuditLog, Metadata};
use crate::core::behavior::BehaviorAnalyzer;
use crate::core::clock::ClockSource;
use crate::core::ddos_detector::{DdosDetectionConfig, DdosDetector, DdosVerdict};
use crate::core::history::RequestEntry;
use crate::core::profiles::{ClientState, ProfileStore};
use crate::core::rate_limiter::AdaptiveLimiter;
use crate::core::risk::{ExternalSignals, RiskScorer};
use crate::core::store::{with_timeout, PersistenceStore, StoreError};
use crate::core::telemetry::{
    METRIC_BLOCKED, METRIC_CLIENTS, METRIC_DDOS_RPS, METRIC_DENIED, METRIC_REQUESTS, METRIC_VIOLATIONS,
};
use crate::core::violations::ViolationLedger;
use crate::models::{
    ClientRiskSummary, Decision, EngineSettings, RateLimitConfig, RequestContext, Severity, Statistics, ThreatLevel,
    AUTH_POLICY, DEFAULT_POLICY,
};
use crate::utils::seconds;

pub const SOURCE: &str = "admission";
pub const PROFILES_KEY: &str = "profiles:snapshot";

pub const REASON_ALLOWED: &str = "within limit";
pub const REASON_RATE_LIMITED: &str = "rate limit exceeded";
pub const REASON_BLOCKED: &str = "temporarily blocked";

/// Response time samples kept for the latency signal
const LATENCY_SAMPLES: usize = 1000;

/// Errors returned by administrative engine calls
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid policy {name}: {reason}")]
    InvalidPolicy { name: String, reason: String },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Handles the engine is built from
pub struct Collaborators {
    pub clock: Arc<dyn ClockSource>,
    pub store: Arc<dyn PersistenceStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub audit: Arc<AuditLog>,
    pub store_timeout: Duration,
}

/// Blocklist changes made by one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlocklistUpdate {
    pub expired: Vec<String>,
    pub added: Vec<String>,
}

impl BlocklistUpdate {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.added.is_empty()
    }
}

pub struct AdmissionDecider {
    clock: Arc<dyn ClockSource>,
    store: Arc<dyn PersistenceStore>,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditLog>,
    store_timeout: Duration,
    settings: EngineSettings,
    configs: RwLock<HashMap<String, RateLimitConfig>>,
    profiles: ProfileStore,
    ledger: ViolationLedger,
    analyzer: BehaviorAnalyzer,
    scorer: RiskScorer,
    limiter: AdaptiveLimiter,
    detector: DdosDetector,
    malicious_ips: RwLock<HashSet<String>>,
    /// (recorded at, milliseconds)
    latencies: Mutex<VecDeque<(DateTime<Utc>, f64)>>,
    blocked_since_tick: AtomicU64,
    last_verdict: RwLock<DdosVerdict>,
}

impl AdmissionDecider {
    /// Create an engine with the built-in policies
    pub fn new(collaborators: Collaborators, settings: EngineSettings) -> Self {
        let Collaborators {
            clock,
            store,
            alerts,
            audit,
            store_timeout,
        } = collaborators;
        let detector = DdosDetector::new(DdosDetectionConfig {
            window_secs: settings.ddos_window_secs,
            load_capacity_rps: settings.load_capacity_rps,
            ..DdosDetectionConfig::default()
        });
        let now = clock.now();
        Self {
            clock,
            store,
            alerts,
            audit,
            store_timeout,
            profiles: ProfileStore::new(settings.max_history_per_client),
            settings,
            configs: RwLock::new(RateLimitConfig::builtin()),
            ledger: ViolationLedger::new(),
            analyzer: BehaviorAnalyzer::new(),
            scorer: RiskScorer::new(),
            limiter: AdaptiveLimiter::new(),
            detector,
            malicious_ips: RwLock::new(HashSet::new()),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLES)),
            blocked_since_tick: AtomicU64::new(0),
            last_verdict: RwLock::new(DdosVerdict::quiet(now)),
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Decide whether `client_id` may proceed under the named policy.
    /// Unknown policy names fall back to `default`.
    pub fn check(&self, client_id: &str, config_name: &str, ctx: &RequestContext) -> Decision {
        let now = self.clock.now();
        let (policy, config) = self.resolve(config_name);
        counter!(METRIC_REQUESTS, 1);

        let handle = self.profiles.get_or_create(client_id, now);
        let mut state = handle.lock();
        state.profile.last_activity = now;

        // an escalation outlives its block entry until an administrator lifts it
        let block = match self.ledger.active_block(client_id, now) {
            Some(block) => Some(block),
            None if state.profile.escalated => Some(self.ledger.escalate(&mut state.profile, now)),
            None => None,
        };
        if let Some(block) = block {
            let decision = Decision {
                allowed: false,
                remaining: 0,
                reset_at: block.until,
                risk_score: state.profile.risk_score,
                threat_level: state.profile.threat_level,
                reason: REASON_BLOCKED.to_string(),
            };
            drop(state);
            self.blocked_since_tick.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_BLOCKED, 1);
            counter!(METRIC_DENIED, 1);
            debug!("Client {} is blocked until {} ({})", client_id, block.until, block.reason);
            let mut metadata = client_metadata(client_id, &policy);
            metadata.insert("blocked_until".to_string(), serde_json::json!(block.until));
            self.audit.record(
                "blocked_request",
                Severity::Low,
                SOURCE,
                format!("Request from {} denied: blocked until {}", client_id, block.until),
                metadata,
            );
            return decision;
        }

        let signals = self.signals(ctx);
        let ClientState {
            profile,
            history,
            known_malicious,
        } = &mut *state;
        *known_malicious = signals.is_known_malicious_ip;
        history.record(RequestEntry::from_context(now, ctx));
        profile.behavior = self.analyzer.analyze(history);
        self.scorer.apply(profile, history.len(), &signals, now);

        let effective = self.limiter.effective_limit(&config, profile, self.system_load());
        profile.adaptive_limit = effective;
        let threshold = self.limiter.admission_threshold(&config, effective);
        let window = seconds(config.window_seconds);
        let window_start = now - window;
        let count = history.count_since(window_start);

        if count <= threshold as usize {
            let decision = Decision {
                allowed: true,
                remaining: (effective as usize).saturating_sub(count) as u32,
                reset_at: history.oldest_since(window_start).unwrap_or(now) + window,
                risk_score: profile.risk_score,
                threat_level: profile.threat_level,
                reason: REASON_ALLOWED.to_string(),
            };
            drop(state);
            if policy == AUTH_POLICY {
                self.audit.record(
                    "auth_attempt",
                    Severity::Low,
                    SOURCE,
                    format!("Authentication attempt from {} admitted", client_id),
                    client_metadata(client_id, &policy),
                );
            }
            return decision;
        }

        let outcome = self
            .ledger
            .record_violation(profile, &policy, &config, count, effective, now);
        counter!(METRIC_VIOLATIONS, 1);
        counter!(METRIC_DENIED, 1);
        self.scorer.apply(profile, history.len(), &signals, now);

        let escalated = profile.threat_level == ThreatLevel::Critical;
        let reset_at = if escalated {
            self.ledger.escalate(profile, now).until
        } else {
            outcome.blocked_until
        };
        let decision = Decision {
            allowed: false,
            remaining: 0,
            reset_at,
            risk_score: profile.risk_score,
            threat_level: profile.threat_level,
            reason: REASON_RATE_LIMITED.to_string(),
        };
        drop(state);

        let mut metadata = client_metadata(client_id, &policy);
        metadata.insert("observed_count".to_string(), serde_json::json!(count));
        metadata.insert("limit".to_string(), serde_json::json!(effective));
        metadata.insert("recent_violations".to_string(), serde_json::json!(outcome.recent_violations));
        metadata.insert(
            "block_seconds".to_string(),
            serde_json::json!(outcome.block_duration.num_seconds()),
        );
        self.audit.record(
            "rate_limit_exceeded",
            outcome.severity,
            SOURCE,
            format!("Client {} exceeded {} with {} requests (limit {})", client_id, policy, count, effective),
            metadata.clone(),
        );

        if escalated {
            metadata.insert("risk_score".to_string(), serde_json::json!(decision.risk_score));
            metadata.insert("blocked_until".to_string(), serde_json::json!(reset_at));
            let message = format!("Client {} reached a critical threat level and is blocked until {}", client_id, reset_at);
            self.audit
                .record(CRITICAL_THREAT_DETECTED, Severity::Critical, SOURCE, message.clone(), metadata.clone());
            self.alerts
                .emit(Alert::new(CRITICAL_THREAT_DETECTED, Severity::Critical, message, metadata, now));
        }
        decision
    }

    fn resolve(&self, config_name: &str) -> (String, RateLimitConfig) {
        let configs = self.configs.read();
        if let Some(config) = configs.get(config_name) {
            return (config_name.to_string(), config.clone());
        }
        debug!("Unknown policy {}, using {}", config_name, DEFAULT_POLICY);
        let config = configs.get(DEFAULT_POLICY).cloned().unwrap_or_default();
        (DEFAULT_POLICY.to_string(), config)
    }

    fn signals(&self, ctx: &RequestContext) -> ExternalSignals {
        let listed = ctx
            .ip_address
            .as_ref()
            .map_or(false, |ip| self.malicious_ips.read().contains(ip));
        ExternalSignals {
            is_known_malicious_ip: ctx.known_malicious || listed,
        }
    }

    fn system_load(&self) -> f64 {
        self.last_verdict.read().metrics.system_load
    }

    /// Add or replace a named policy
    pub fn set_config(&self, name: &str, config: RateLimitConfig) -> Result<(), EngineError> {
        validate_policy(&config, self.settings.max_history_per_client).map_err(|reason| EngineError::InvalidPolicy {
            name: name.to_string(),
            reason,
        })?;
        info!("Updated rate limit policy {}: {:?}", name, config);
        self.configs.write().insert(name.to_string(), config);
        Ok(())
    }

    pub fn configs(&self) -> BTreeMap<String, RateLimitConfig> {
        self.configs
            .read()
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect()
    }

    /// Feed one response time sample into the latency signal
    pub fn record_response_time(&self, client_id: &str, millis: f64) {
        let now = self.clock.now();
        let mut latencies = self.latencies.lock();
        if latencies.len() == LATENCY_SAMPLES {
            latencies.pop_front();
        }
        latencies.push_back((now, millis.max(0.0)));
        debug!("Response time for {}: {:.1}ms", client_id, millis);
    }

    fn average_response_time(&self, since: DateTime<Utc>) -> f64 {
        let latencies = self.latencies.lock();
        let (sum, n) = latencies
            .iter()
            .filter(|(at, _)| *at >= since)
            .fold((0.0, 0usize), |(sum, n), (_, ms)| (sum + ms, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    /// Mark an IP address as known-malicious
    pub fn add_known_malicious_ip(&self, ip: &str) -> bool {
        let added = self.malicious_ips.write().insert(ip.to_string());
        if added {
            info!("Added {} to the known-malicious IP set", ip);
        }
        added
    }

    /// Lift a client's block, including a critical escalation. Returns false
    /// when the client was not blocked.
    pub fn unblock(&self, client_id: &str) -> bool {
        let now = self.clock.now();
        let removed = self.ledger.unblock(client_id);
        if let Some(handle) = self.profiles.get(client_id) {
            let mut state = handle.lock();
            let ClientState {
                profile,
                history,
                known_malicious,
            } = &mut *state;
            profile.escalated = false;
            profile.violations.clear();
            let signals = ExternalSignals {
                is_known_malicious_ip: *known_malicious,
            };
            self.scorer.apply(profile, history.len(), &signals, now);
        }
        if removed {
            info!("Client {} unblocked by administrator", client_id);
            self.audit.record(
                "client_unblocked",
                Severity::Medium,
                SOURCE,
                format!("Client {} unblocked by administrator", client_id),
                client_metadata(client_id, DEFAULT_POLICY),
            );
        }
        removed
    }

    pub fn is_blocked(&self, client_id: &str) -> bool {
        self.ledger.is_blocked(client_id, self.clock.now())
    }

    pub fn get_statistics(&self) -> Statistics {
        let now = self.clock.now();
        let active_since = now - seconds(self.settings.active_window_secs);
        let profiles = self.profiles.profiles();
        let active_clients = profiles.iter().filter(|p| p.last_activity >= active_since).count();

        let mut ranked: Vec<ClientRiskSummary> = profiles
            .iter()
            .map(|p| ClientRiskSummary {
                client_id: p.client_id.clone(),
                risk_score: p.risk_score,
                threat_level: p.threat_level,
                violations: p.violations.len(),
                last_activity: p.last_activity,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.risk_score
                .total_cmp(&a.risk_score)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        ranked.truncate(self.settings.top_risk_clients);

        Statistics {
            total_clients: profiles.len(),
            active_clients,
            blocked_clients: self.ledger.active_count(now),
            ddos_metrics: self.last_verdict.read().metrics.clone(),
            top_risk_clients: ranked,
        }
    }

    pub fn last_verdict(&self) -> DdosVerdict {
        self.last_verdict.read().clone()
    }

    /// Grade system-wide traffic over the trailing window and publish the
    /// resulting metrics
    pub fn run_ddos_detection(&self) -> DdosVerdict {
        let now = self.clock.now();
        let since = now - seconds(self.detector.config().window_secs);
        let activity = self.profiles.activity_since(since);
        let avg_response_ms = self.average_response_time(since);
        let blocked = self.blocked_since_tick.swap(0, Ordering::Relaxed);
        let verdict = self.detector.analyze(&activity, avg_response_ms, blocked, now);

        gauge!(METRIC_DDOS_RPS, verdict.requests_per_second);
        gauge!(METRIC_CLIENTS, self.profiles.len() as f64);

        if verdict.is_under_attack {
            warn!(
                "DDoS attack detected: severity {}, {:.1} rps, {:.0}% suspicious",
                verdict.severity.as_str(),
                verdict.requests_per_second,
                verdict.suspicious_ratio * 100.0
            );
            let mut metadata = Metadata::new();
            metadata.insert("severity".to_string(), serde_json::json!(verdict.severity));
            metadata.insert("requests_per_second".to_string(), serde_json::json!(verdict.requests_per_second));
            metadata.insert("suspicious_ratio".to_string(), serde_json::json!(verdict.suspicious_ratio));
            metadata.insert("metrics".to_string(), serde_json::json!(verdict.metrics));
            metadata.insert("recommendations".to_string(), serde_json::json!(verdict.recommendations));
            let severity = Severity::from(verdict.severity);
            let message = format!(
                "{} severity DDoS attack: {:.1} requests per second from {} clients",
                verdict.severity.as_str(),
                verdict.requests_per_second,
                verdict.metrics.unique_clients
            );
            self.audit
                .record(DDOS_ATTACK_DETECTED, severity, "ddos_detector", message.clone(), metadata.clone());
            self.alerts
                .emit(Alert::new(DDOS_ATTACK_DETECTED, severity, message, metadata, now));
        }

        *self.last_verdict.write() = verdict.clone();
        verdict
    }

    /// Drop expired blocks, renew escalations and block clients whose current
    /// threat level is high or critical
    pub fn maintain_blocklist(&self) -> BlocklistUpdate {
        let now = self.clock.now();
        let expired = self.ledger.sweep_expired(now);
        let until = now + seconds(self.settings.auto_block_secs);

        let mut added = Vec::new();
        for handle in self.profiles.handles() {
            let mut state = handle.lock();
            let ClientState {
                profile,
                history,
                known_malicious,
            } = &mut *state;
            history.prune(now);
            ViolationLedger::prune(profile, now);
            let signals = ExternalSignals {
                is_known_malicious_ip: *known_malicious,
            };
            self.scorer.apply(profile, history.len(), &signals, now);
            if self.ledger.is_blocked(&profile.client_id, now) {
                continue;
            }
            if profile.escalated {
                self.ledger.escalate(profile, now);
                added.push(profile.client_id.clone());
            } else if profile.threat_level >= ThreatLevel::High {
                self.ledger.block(&profile.client_id, until, "auto-blocklist", false, now);
                added.push(profile.client_id.clone());
            }
        }
        added.sort();

        let update = BlocklistUpdate { expired, added };
        if !update.is_empty() {
            info!(
                "Blocklist updated: {} expired, {} auto-blocked",
                update.expired.len(),
                update.added.len()
            );
            let mut metadata = Metadata::new();
            metadata.insert("expired".to_string(), serde_json::json!(update.expired));
            metadata.insert("added".to_string(), serde_json::json!(update.added));
            metadata.insert("blocked_until".to_string(), serde_json::json!(until));
            let message = format!(
                "Auto-blocklist updated: {} removed, {} added",
                update.expired.len(),
                update.added.len()
            );
            self.audit
                .record(AUTO_BLOCK_LIST_UPDATED, Severity::Medium, "sweeper", message.clone(), metadata.clone());
            self.alerts
                .emit(Alert::new(AUTO_BLOCK_LIST_UPDATED, Severity::Medium, message, metadata, now));
        }
        update
    }

    /// Evict profiles idle for longer than the configured TTL
    pub fn evict_stale_profiles(&self) -> usize {
        let now = self.clock.now();
        let evicted = self
            .profiles
            .evict_stale(now, seconds(self.settings.profile_ttl_secs));
        if !evicted.is_empty() {
            info!("Evicted {} stale client profiles", evicted.len());
        }
        gauge!(METRIC_CLIENTS, self.profiles.len() as f64);
        evicted.len()
    }

    /// Write a snapshot of every profile to the store
    pub async fn persist_profiles(&self) -> Result<usize, EngineError> {
        let profiles = self.profiles.profiles();
        let json = serde_json::to_string(&profiles)?;
        with_timeout(self.store_timeout, self.store.put(PROFILES_KEY, json)).await?;
        debug!("Persisted {} client profiles", profiles.len());
        Ok(profiles.len())
    }

    /// Load the last snapshot. Clients already seen keep their live state.
    pub async fn restore_profiles(&self) -> Result<usize, EngineError> {
        let raw = with_timeout(self.store_timeout, self.store.get(PROFILES_KEY)).await?;
        let profiles = match raw {
            Some(json) => serde_json::from_str(&json)?,
            None => return Ok(0),
        };
        let restored = self.profiles.restore(profiles);
        info!("Restored {} client profiles", restored);
        Ok(restored)
    }
}

fn client_metadata(client_id: &str, policy: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("client_id".to_string(), serde_json::json!(client_id));
    metadata.insert("config".to_string(), serde_json::json!(policy));
    metadata
}
