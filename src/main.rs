//! Admission Guard Service
//!
//! This is the main entry point for the admission service.
//! It initializes the engine components and starts the web server.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use admission_guard::api::{self, ApiState};
use admission_guard::config;
use admission_guard::core::alerting::{AlertSink, LogAlertSink, WebhookAlertSink};
use admission_guard::core::{
    telemetry, AdmissionDecider, AuditLog, BackgroundTasks, ClockSource, Collaborators, MemoryStore,
    PersistenceStore, RedisStore, SystemClock,
};
use admission_guard::models::Settings;
use admission_guard::utils::milliseconds;

fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn PersistenceStore>> {
    match settings.storage.backend.as_str() {
        "redis" => {
            let store = RedisStore::open(&settings.redis.url).context("Failed to create Redis client")?;
            info!("Persisting to Redis at {}", settings.redis.url);
            Ok(Arc::new(store))
        }
        _ => {
            warn!("Using in-memory persistence, state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn alert_sink(settings: &Settings) -> anyhow::Result<Arc<dyn AlertSink>> {
    match &settings.alerting.webhook_url {
        Some(url) => {
            let sink = WebhookAlertSink::new(url.clone(), milliseconds(settings.alerting.timeout_ms))
                .context("Failed to create webhook client")?;
            info!("Delivering alerts to {}", url);
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(LogAlertSink)),
    }
}

fn install_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            telemetry::register_descriptions();
            Some(handle)
        }
        Err(e) => {
            warn!("Metrics disabled: {}", e);
            None
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Admission Guard Service...");

    // Load configuration
    let settings = config::load_config().context("Failed to load configuration")?;
    let metrics = install_metrics();

    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock::new());
    let store = open_store(&settings)?;
    let alerts = alert_sink(&settings)?;
    let store_timeout = milliseconds(settings.storage.timeout_ms);

    let audit = Arc::new(AuditLog::new(
        store.clone(),
        clock.clone(),
        alerts.clone(),
        settings.audit.clone(),
        store_timeout,
    ));
    let engine = Arc::new(AdmissionDecider::new(
        Collaborators {
            clock,
            store,
            alerts,
            audit: audit.clone(),
            store_timeout,
        },
        settings.engine.clone(),
    ));
    for (name, policy) in &settings.rate_limits {
        engine.set_config(name, policy.clone())?;
    }
    if let Err(e) = engine.restore_profiles().await {
        warn!("Starting without persisted profiles: {}", e);
    }

    let tasks = BackgroundTasks::spawn(
        engine.clone(),
        audit.clone(),
        std::time::Duration::from_secs(settings.engine.sweep_interval_secs),
    );

    // Create API state
    let state = web::Data::new(ApiState { engine, audit, metrics });

    // Start HTTP server
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((settings.server.host.as_str(), settings.server.port))?
        .run();
    info!("Listening on {}:{}", settings.server.host, settings.server.port);
    let result = server.await;

    tasks.shutdown().await;
    result.context("HTTP server failed")
}
