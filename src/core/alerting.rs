//! Alert delivery for the admission service.
//!
//! Alerts are fire-and-forget: the engine never waits for delivery and never
//! depends on it succeeding.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::Severity;

pub const CRITICAL_THREAT_DETECTED: &str = "critical_threat_detected";
pub const DDOS_ATTACK_DETECTED: &str = "ddos_attack_detected";
pub const AUTO_BLOCK_LIST_UPDATED: &str = "auto_block_list_updated";
pub const AUDIT_INTEGRITY_VIOLATION: &str = "audit_integrity_violation";

/// Alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Alert ID
    pub id: String,
    /// Alert kind, e.g. `ddos_attack_detected`
    pub kind: String,
    /// Alert severity
    pub severity: Severity,
    /// Alert message
    pub message: String,
    /// Structured details
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Alert creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        kind: &str,
        severity: Severity,
        message: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            severity,
            message: message.into(),
            metadata,
            created_at,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: Alert);
}

/// Writes alerts to the log and nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn emit(&self, alert: Alert) {
        match alert.severity {
            Severity::Critical | Severity::High => error!("[alert:{}] {}", alert.kind, alert.message),
            Severity::Medium => warn!("[alert:{}] {}", alert.kind, alert.message),
            Severity::Low => debug!("[alert:{}] {}", alert.kind, alert.message),
        }
    }
}

/// Fans alerts out to in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastAlertSink {
    sender: broadcast::Sender<Alert>,
}

impl BroadcastAlertSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }
}

impl AlertSink for BroadcastAlertSink {
    fn emit(&self, alert: Alert) {
        // no subscribers is not an error
        let _ = self.sender.send(alert);
    }
}

/// Posts alerts as JSON to a webhook
pub struct WebhookAlertSink {
    /// HTTP client
    client: Client,
    /// Webhook URL
    url: String,
}

impl WebhookAlertSink {
    /// Create a new webhook sink with a per-request timeout
    pub fn new(url: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

impl AlertSink for WebhookAlertSink {
    fn emit(&self, alert: Alert) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No runtime available, dropping alert {} ({})", alert.id, alert.kind);
                return;
            }
        };
        let client = self.client.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            let result = client.post(&url).json(&alert).send().await;
            match result.and_then(|response| response.error_for_status()) {
                Ok(_) => debug!("Delivered alert {} to {}", alert.id, url),
                Err(e) => warn!("Failed to deliver alert {} to {}: {}", alert.id, url, e),
            }
        });
    }
}
