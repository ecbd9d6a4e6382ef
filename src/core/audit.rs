//! Tamper-evident audit journal.
//!
//! Events are hashed at creation and queued in memory. The queue is flushed
//! into the persistence collaborator on a timer, or immediately for high and
//! critical events. A failed flush keeps the batch queued for the next
//! attempt.
//!
//! The journal is stored as one JSON record per line and every line is
//! decoded on its own. Lines that do not decode, and events whose hash no
//! longer matches, are quarantined and never reach search results, reports
//! or exports.

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::core::alerting::{Alert, AlertSink, AUDIT_INTEGRITY_VIOLATION};
use crate::core::audit_report::AuditReport;
use crate::core::clock::ClockSource;
use crate::core::self_log::SelfLogger;
use crate::core::store::{with_timeout, PersistenceStore, StoreError};
use crate::core::telemetry::{METRIC_AUDIT_FLUSH_FAILURES, METRIC_AUDIT_QUEUE_DEPTH};
use crate::models::{AuditSettings, Severity};

pub const EVENTS_KEY: &str = "audit:events";
pub const QUARANTINE_KEY: &str = "audit:quarantine";
pub const META_KEY: &str = "audit:meta";

/// Column order shared by the JSON and CSV exports
pub const EXPORT_FIELDS: [&str; 10] = [
    "id",
    "timestamp",
    "event_type",
    "severity",
    "source",
    "message",
    "session_id",
    "integrity_hash",
    "compacted",
    "metadata",
];

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Errors that can occur during audit operations
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid time range: {start} is after {end}")]
    InvalidRange { start: DateTime<Utc>, end: DateTime<Utc> },
}

/// Audit journal entry. Field order is the export column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub source: String,
    pub message: String,
    pub session_id: String,
    pub integrity_hash: String,
    /// Metadata was dropped by compaction
    #[serde(default)]
    pub compacted: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl AuditEvent {
    pub fn new(
        event_type: &str,
        severity: Severity,
        source: &str,
        message: impl Into<String>,
        metadata: Metadata,
        session_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut event = Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            event_type: event_type.to_string(),
            severity,
            source: source.to_string(),
            message: message.into(),
            session_id: session_id.to_string(),
            integrity_hash: String::new(),
            compacted: false,
            metadata,
        };
        event.integrity_hash = event.compute_hash();
        event
    }

    /// SHA-256 over the immutable fields
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let timestamp = self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        for field in [
            self.id.as_str(),
            timestamp.as_str(),
            self.event_type.as_str(),
            self.severity.as_str(),
            self.source.as_str(),
            self.message.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self) -> bool {
        self.integrity_hash == self.compute_hash()
    }
}

/// Search criteria. Every set field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub severity: Option<Severity>,
    pub source: Option<String>,
    /// Case-insensitive substring of the message, type, source or metadata
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if self.start.map_or(false, |start| event.timestamp < start) {
            return false;
        }
        if self.end.map_or(false, |end| event.timestamp > end) {
            return false;
        }
        if self.event_type.as_deref().map_or(false, |t| t != event.event_type) {
            return false;
        }
        if self.severity.map_or(false, |s| s != event.severity) {
            return false;
        }
        if self.source.as_deref().map_or(false, |s| s != event.source) {
            return false;
        }
        match self.text.as_deref() {
            Some(text) => {
                let needle = text.to_lowercase();
                event.message.to_lowercase().contains(&needle)
                    || event.event_type.to_lowercase().contains(&needle)
                    || event.source.to_lowercase().contains(&needle)
                    || event
                        .metadata
                        .values()
                        .any(|v| v.to_string().to_lowercase().contains(&needle))
            }
            None => true,
        }
    }
}

/// Journal record pulled out of storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum QuarantinedRecord {
    /// Decoded, but the hash no longer matches
    HashMismatch { event: AuditEvent },
    /// Not a readable event record
    Unreadable { raw: String },
}

impl QuarantinedRecord {
    /// Event id, or a digest of the raw line for unreadable records
    pub fn key(&self) -> String {
        match self {
            QuarantinedRecord::HashMismatch { event } => event.id.clone(),
            QuarantinedRecord::Unreadable { raw } => {
                format!("unreadable:{}", hex::encode(Sha256::digest(raw.as_bytes())))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(AuditError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditMeta {
    session_id: String,
    last_flush: DateTime<Utc>,
    total_flushed: u64,
    persisted_events: usize,
}

pub struct AuditLog {
    store: Arc<dyn PersistenceStore>,
    clock: Arc<dyn ClockSource>,
    alerts: Arc<dyn AlertSink>,
    settings: AuditSettings,
    store_timeout: Duration,
    session_id: String,
    queue: Mutex<VecDeque<AuditEvent>>,
    flush_lock: tokio::sync::Mutex<()>,
    urgent: Notify,
    quarantine: Mutex<BTreeMap<String, QuarantinedRecord>>,
    /// Quarantine holds records not yet written to the store
    quarantine_dirty: AtomicBool,
    self_log: SelfLogger,
    dropped: AtomicU64,
    total_flushed: AtomicU64,
}

impl AuditLog {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        clock: Arc<dyn ClockSource>,
        alerts: Arc<dyn AlertSink>,
        settings: AuditSettings,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            alerts,
            settings,
            store_timeout,
            session_id: Uuid::new_v4().to_string(),
            queue: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            urgent: Notify::new(),
            quarantine: Mutex::new(BTreeMap::new()),
            quarantine_dirty: AtomicBool::new(false),
            self_log: SelfLogger::default(),
            dropped: AtomicU64::new(0),
            total_flushed: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.settings.flush_interval_secs.max(1))
    }

    /// Queue an event without touching storage. High and critical events wake
    /// the flush task.
    pub fn record(
        &self,
        event_type: &str,
        severity: Severity,
        source: &str,
        message: impl Into<String>,
        metadata: Metadata,
    ) -> AuditEvent {
        let event = AuditEvent::new(event_type, severity, source, message, metadata, &self.session_id, self.clock.now());
        let (depth, dropped) = {
            let mut queue = self.queue.lock();
            queue.push_back(event.clone());
            let dropped = trim_front(&mut queue, self.settings.max_queue);
            (queue.len(), dropped)
        };
        gauge!(METRIC_AUDIT_QUEUE_DEPTH, depth as f64);
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            self.self_log
                .report(self.clock.now(), format!("queue full, dropped {} oldest events", dropped));
        }
        if severity.is_urgent() {
            self.urgent.notify_one();
        }
        event
    }

    /// Queue an event. High and critical events are flushed before returning.
    pub async fn log_event(
        &self,
        event_type: &str,
        severity: Severity,
        source: &str,
        message: impl Into<String>,
        metadata: Metadata,
    ) -> AuditEvent {
        let event = self.record(event_type, severity, source, message, metadata);
        if severity.is_urgent() {
            // failures are already reported and the event stays queued
            let _ = self.flush().await;
        }
        event
    }

    /// Resolves when an urgent event has been queued
    pub async fn wait_urgent(&self) {
        self.urgent.notified().await;
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn self_log(&self) -> &SelfLogger {
        &self.self_log
    }

    /// Records found tampered or unreadable so far
    pub fn quarantined(&self) -> Vec<QuarantinedRecord> {
        self.quarantine.lock().values().cloned().collect()
    }

    /// Merge queued events into storage. On failure the batch is put back at
    /// the front of the queue.
    pub async fn flush(&self) -> Result<usize, AuditError> {
        let _guard = self.flush_lock.lock().await;
        let batch: Vec<AuditEvent> = self.queue.lock().drain(..).collect();
        if batch.is_empty() {
            return Ok(0);
        }

        match self.persist(&batch).await {
            Ok(persisted) => {
                let total = self.total_flushed.fetch_add(batch.len() as u64, Ordering::Relaxed) + batch.len() as u64;
                debug!("Flushed {} audit events ({} persisted)", batch.len(), persisted);
                self.write_meta(total, persisted).await;
                gauge!(METRIC_AUDIT_QUEUE_DEPTH, self.pending() as f64);
                Ok(batch.len())
            }
            Err(e) => {
                let count = batch.len();
                self.requeue(batch);
                counter!(METRIC_AUDIT_FLUSH_FAILURES, 1);
                self.self_log
                    .report(self.clock.now(), format!("flush of {} events failed: {}", count, e));
                Err(e)
            }
        }
    }

    async fn persist(&self, batch: &[AuditEvent]) -> Result<usize, AuditError> {
        let mut events = self.load_persisted().await?;
        events.extend(batch.iter().cloned());
        let excess = events.len().saturating_sub(self.settings.max_events);
        events.drain(..excess);
        let compacted = compact(&mut events, self.settings.compress_threshold);
        if compacted > 0 {
            debug!("Compacted {} audit events", compacted);
        }
        let journal = encode_journal(&events)?;
        with_timeout(self.store_timeout, self.store.put(EVENTS_KEY, journal)).await?;
        Ok(events.len())
    }

    async fn write_meta(&self, total_flushed: u64, persisted_events: usize) {
        let meta = AuditMeta {
            session_id: self.session_id.clone(),
            last_flush: self.clock.now(),
            total_flushed,
            persisted_events,
        };
        let result = match serde_json::to_string(&meta) {
            Ok(json) => with_timeout(self.store_timeout, self.store.put(META_KEY, json))
                .await
                .map_err(AuditError::from),
            Err(e) => Err(AuditError::from(e)),
        };
        if let Err(e) = result {
            self.self_log.report(self.clock.now(), format!("meta write failed: {}", e));
        }
    }

    fn requeue(&self, batch: Vec<AuditEvent>) {
        let mut queue = self.queue.lock();
        let newer: Vec<AuditEvent> = queue.drain(..).collect();
        queue.extend(batch);
        queue.extend(newer);
        let dropped = trim_front(&mut queue, self.settings.max_queue);
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    /// Persisted events that pass the integrity check, oldest first. Bad
    /// records are written to quarantine before this returns, so a later
    /// journal rewrite never loses them.
    async fn load_persisted(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let raw = with_timeout(self.store_timeout, self.store.get(EVENTS_KEY)).await?;
        let (events, unreadable) = match raw {
            Some(journal) => decode_journal(&journal),
            None => (Vec::new(), Vec::new()),
        };
        let (valid, tampered): (Vec<AuditEvent>, Vec<AuditEvent>) = events.into_iter().partition(AuditEvent::verify);
        let bad: Vec<QuarantinedRecord> = tampered
            .into_iter()
            .map(|event| QuarantinedRecord::HashMismatch { event })
            .chain(unreadable.into_iter().map(|raw| QuarantinedRecord::Unreadable { raw }))
            .collect();
        self.quarantine_records(bad).await?;
        Ok(valid)
    }

    async fn quarantine_records(&self, records: Vec<QuarantinedRecord>) -> Result<(), AuditError> {
        let mut fresh = Vec::new();
        {
            let mut quarantine = self.quarantine.lock();
            for record in records {
                let key = record.key();
                if !quarantine.contains_key(&key) {
                    quarantine.insert(key.clone(), record);
                    fresh.push(key);
                }
            }
        }
        if !fresh.is_empty() {
            self.quarantine_dirty.store(true, Ordering::SeqCst);
        }

        let now = self.clock.now();
        for key in &fresh {
            error!("Audit journal record {} failed its integrity check and was quarantined", key);
            let mut metadata = Metadata::new();
            metadata.insert("record".to_string(), serde_json::json!(key));
            self.alerts.emit(Alert::new(
                AUDIT_INTEGRITY_VIOLATION,
                Severity::Critical,
                format!("Audit journal record {} was modified after it was written", key),
                metadata,
                now,
            ));
        }

        if !self.quarantine_dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        let json = serde_json::to_string(&self.quarantined())?;
        match with_timeout(self.store_timeout, self.store.put(QUARANTINE_KEY, json)).await {
            Ok(()) => {
                self.quarantine_dirty.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.self_log.report(now, format!("quarantine write failed: {}", e));
                Err(e.into())
            }
        }
    }

    /// Persisted and queued events, oldest first
    async fn all_events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let _guard = self.flush_lock.lock().await;
        let mut events = self.load_persisted().await?;
        events.extend(self.queue.lock().iter().cloned());
        Ok(events)
    }

    /// Matching events, newest first
    pub async fn search(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let mut events = self.all_events().await?;
        events.retain(|e| filter.matches(e));
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    pub async fn generate_report(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<AuditReport, AuditError> {
        if start > end {
            return Err(AuditError::InvalidRange { start, end });
        }
        let filter = AuditFilter {
            start: Some(start),
            end: Some(end),
            ..AuditFilter::default()
        };
        let events = self.search(&filter).await?;
        let quarantined = self.quarantine.lock().len();
        Ok(AuditReport::build(start, end, &events, quarantined))
    }

    /// Every valid event in chronological order
    pub async fn export(&self, format: &str) -> Result<String, AuditError> {
        let format: ExportFormat = format.parse()?;
        let events = self.all_events().await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&events)?),
            ExportFormat::Csv => to_csv(&events),
        }
    }
}

/// One JSON record per line. Newlines inside strings are escaped by the
/// encoder, so a line never splits a record.
fn encode_journal(events: &[AuditEvent]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(event)?);
        out.push('\n');
    }
    Ok(out)
}

/// Decoded events plus the lines that could not be decoded
fn decode_journal(journal: &str) -> (Vec<AuditEvent>, Vec<String>) {
    let mut events = Vec::new();
    let mut unreadable = Vec::new();
    for line in journal.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<AuditEvent>(line) {
            Ok(event) => events.push(event),
            Err(_) => unreadable.push(line.to_string()),
        }
    }
    (events, unreadable)
}

fn trim_front(queue: &mut VecDeque<AuditEvent>, max: usize) -> usize {
    let excess = queue.len().saturating_sub(max.max(1));
    queue.drain(..excess);
    excess
}

/// Drop metadata from all but the newest `threshold` events
fn compact(events: &mut [AuditEvent], threshold: usize) -> usize {
    if threshold == 0 || events.len() <= threshold {
        return 0;
    }
    let cut = events.len() - threshold;
    let mut compacted = 0;
    for event in events[..cut].iter_mut().filter(|e| !e.compacted) {
        event.metadata.clear();
        event.compacted = true;
        compacted += 1;
    }
    compacted
}

fn to_csv(events: &[AuditEvent]) -> Result<String, AuditError> {
    let mut out = EXPORT_FIELDS.join(",");
    out.push('\n');
    for event in events {
        let value = serde_json::to_value(event)?;
        let row: Vec<String> = EXPORT_FIELDS
            .iter()
            .map(|field| match value.get(*field) {
                Some(serde_json::Value::String(s)) => csv_escape(s),
                Some(other) => csv_escape(&other.to_string()),
                None => String::new(),
            })
            .collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    Ok(out)
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
