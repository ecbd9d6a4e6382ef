//! Background maintenance for the admission service.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::core::admission::{AdmissionDecider, BlocklistUpdate};
use crate::core::audit::AuditLog;
use crate::core::ddos_detector::DdosVerdict;

/// What one sweep did
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub verdict: DdosVerdict,
    pub blocklist: BlocklistUpdate,
    pub evicted: usize,
    /// Profiles written to the store, `None` when the write failed
    pub persisted: Option<usize>,
}

/// Sweeper implementation
pub struct Sweeper {
    engine: Arc<AdmissionDecider>,
}

impl Sweeper {
    pub fn new(engine: Arc<AdmissionDecider>) -> Self {
        Self { engine }
    }

    /// Run DDoS detection, blocklist maintenance, eviction and the profile
    /// snapshot, in that order
    pub async fn tick(&self) -> SweepReport {
        let verdict = self.engine.run_ddos_detection();
        let blocklist = self.engine.maintain_blocklist();
        let evicted = self.engine.evict_stale_profiles();
        let persisted = match self.engine.persist_profiles().await {
            Ok(count) => Some(count),
            Err(e) => {
                error!("Failed to persist client profiles: {}", e);
                None
            }
        };
        debug!(
            "Sweep done: severity {}, {} blocks expired, {} added, {} profiles evicted",
            verdict.severity.as_str(),
            blocklist.expired.len(),
            blocklist.added.len(),
            evicted
        );
        SweepReport {
            verdict,
            blocklist,
            evicted,
            persisted,
        }
    }
}

/// Handles to the flush and sweep loops
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    audit: Arc<AuditLog>,
}

impl BackgroundTasks {
    /// Start the audit flush loop and the sweeper loop on the current runtime
    pub fn spawn(engine: Arc<AdmissionDecider>, audit: Arc<AuditLog>, sweep_interval: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let flush = tokio::spawn(flush_loop(audit.clone(), rx.clone()));
        let sweep = tokio::spawn(sweep_loop(Sweeper::new(engine), sweep_interval, rx));
        info!(
            "Background tasks started (flush every {:?}, sweep every {:?})",
            audit.flush_interval(),
            sweep_interval
        );
        Self {
            shutdown,
            handles: vec![flush, sweep],
            audit,
        }
    }

    /// Stop both loops, then flush whatever is still queued
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background task failed: {}", e);
            }
        }
        match self.audit.flush().await {
            Ok(count) => info!("Final audit flush wrote {} events", count),
            Err(e) => error!("Final audit flush failed, {} events lost: {}", self.audit.pending(), e),
        }
    }
}

async fn flush_loop(audit: Arc<AuditLog>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(audit.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = audit.wait_urgent() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        // failures are reported by the audit log and retried next round
        if let Ok(count) = audit.flush().await {
            if count > 0 {
                debug!("Flushed {} audit events", count);
            }
        }
    }
}

async fn sweep_loop(sweeper: Sweeper, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweeper.tick().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::admission::{Collaborators, PROFILES_KEY};
    use crate::core::alerting::LogAlertSink;
    use crate::core::audit::{Metadata, EVENTS_KEY};
    use crate::core::clock::ManualClock;
    use crate::core::store::MemoryStore;
    use crate::models::{AuditSettings, EngineSettings, RequestContext, Severity, DEFAULT_POLICY};
    use chrono::{TimeZone, Utc};

    fn setup() -> (Arc<MemoryStore>, Arc<AuditLog>, Arc<AdmissionDecider>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(AuditLog::new(
            store.clone(),
            clock.clone(),
            Arc::new(LogAlertSink),
            AuditSettings::default(),
            Duration::from_millis(100),
        ));
        let engine = Arc::new(AdmissionDecider::new(
            Collaborators {
                clock,
                store: store.clone(),
                alerts: Arc::new(LogAlertSink),
                audit: audit.clone(),
                store_timeout: Duration::from_millis(100),
            },
            EngineSettings::default(),
        ));
        (store, audit, engine)
    }

    #[tokio::test]
    async fn test_tick_persists_profiles() {
        let (store, _audit, engine) = setup();
        engine.check("c1", DEFAULT_POLICY, &RequestContext::default());
        let report = Sweeper::new(engine).tick().await;
        assert!(!report.verdict.is_under_attack);
        assert!(report.blocklist.is_empty());
        assert_eq!(report.evicted, 0);
        assert_eq!(report.persisted, Some(1));
        assert!(store.raw_get(PROFILES_KEY).is_some());
    }

    #[tokio::test]
    async fn test_tick_survives_store_outage() {
        let (store, _audit, engine) = setup();
        store.set_failing(true);
        let report = Sweeper::new(engine).tick().await;
        assert_eq!(report.persisted, None);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queued_events() {
        let (store, audit, engine) = setup();
        let tasks = BackgroundTasks::spawn(engine, audit.clone(), Duration::from_secs(300));
        audit.record("auth_attempt", Severity::Low, "admission", "queued", Metadata::new());
        tasks.shutdown().await;
        assert_eq!(audit.pending(), 0);
        assert!(store.raw_get(EVENTS_KEY).unwrap().contains("queued"));
    }

    #[tokio::test]
    async fn test_urgent_events_wake_the_flush_loop() {
        let (store, audit, engine) = setup();
        let tasks = BackgroundTasks::spawn(engine, audit.clone(), Duration::from_secs(300));
        // let the immediate first tick pass
        tokio::time::sleep(Duration::from_millis(20)).await;
        audit.record("ddos_attack_detected", Severity::High, "ddos_detector", "urgent", Metadata::new());
        let mut flushed = false;
        for _ in 0..50 {
            if store.raw_get(EVENTS_KEY).map_or(false, |raw| raw.contains("urgent")) {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed);
        tasks.shutdown().await;
    }
}
