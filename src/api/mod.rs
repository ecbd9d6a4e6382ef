//! API endpoints for the admission service.
//!
//! This module provides HTTP endpoints for admission checks, policy
//! management, threat intelligence and the audit trail.

use std::collections::BTreeMap;
use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use log::error;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::core::audit::{AuditError, AuditFilter, AuditLog, ExportFormat};
use crate::core::AdmissionDecider;
use crate::models::{RateLimitConfig, RequestContext, DEFAULT_POLICY};

pub struct ApiState {
    pub engine: Arc<AdmissionDecider>,
    pub audit: Arc<AuditLog>,
    /// Prometheus handle, `None` when no recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/check").route(web::post().to(check_admission)))
            .service(web::resource("/response-time").route(web::post().to(record_response_time)))
            .service(web::resource("/statistics").route(web::get().to(get_statistics)))
            .service(web::resource("/configs").route(web::get().to(list_configs)))
            .service(web::resource("/configs/{name}").route(web::put().to(set_config)))
            .service(web::resource("/clients/{id}/unblock").route(web::post().to(unblock_client)))
            .service(web::resource("/threat-intel/ips").route(web::post().to(add_malicious_ip)))
            .service(web::resource("/audit/search").route(web::post().to(search_audit)))
            .service(web::resource("/audit/report").route(web::get().to(audit_report)))
            .service(web::resource("/audit/export").route(web::get().to(export_audit)))
            .service(web::resource("/metrics").route(web::get().to(render_metrics))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

fn error_body(message: impl Into<String>) -> ErrorResponse {
    ErrorResponse { error: message.into() }
}

/// Admission check request
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRequest {
    pub client_id: String,
    #[serde(default)]
    pub config_name: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseTimeRequest {
    pub client_id: String,
    pub millis: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MaliciousIpRequest {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Admission check endpoint. Denied requests get 429 with the same body.
pub async fn check_admission(state: web::Data<ApiState>, req: web::Json<CheckRequest>) -> impl Responder {
    let req = req.into_inner();
    let ctx = RequestContext {
        ip_address: req.ip_address,
        user_agent: req.user_agent,
        known_malicious: false,
        metadata: req.metadata.unwrap_or_default(),
    };
    let config_name = req.config_name.as_deref().unwrap_or(DEFAULT_POLICY);
    let decision = state.engine.check(&req.client_id, config_name, &ctx);

    let mut response = if decision.allowed {
        HttpResponse::Ok()
    } else {
        HttpResponse::TooManyRequests()
    };
    response
        .insert_header(("X-RateLimit-Remaining", decision.remaining.to_string()))
        .insert_header(("X-RateLimit-Reset", decision.reset_at.timestamp().to_string()))
        .json(decision)
}

async fn record_response_time(state: web::Data<ApiState>, req: web::Json<ResponseTimeRequest>) -> impl Responder {
    if !req.millis.is_finite() || req.millis < 0.0 {
        return HttpResponse::BadRequest().json(error_body("millis must be a non-negative number"));
    }
    state.engine.record_response_time(&req.client_id, req.millis);
    HttpResponse::NoContent().finish()
}

async fn get_statistics(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.get_statistics())
}

async fn list_configs(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.configs())
}

async fn set_config(
    state: web::Data<ApiState>,
    name: web::Path<String>,
    policy: web::Json<RateLimitConfig>,
) -> impl Responder {
    match state.engine.set_config(&name, policy.into_inner()) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "name": name.as_str(), "updated": true })),
        Err(e) => HttpResponse::BadRequest().json(error_body(e.to_string())),
    }
}

async fn unblock_client(state: web::Data<ApiState>, id: web::Path<String>) -> impl Responder {
    let unblocked = state.engine.unblock(&id);
    HttpResponse::Ok().json(serde_json::json!({ "client_id": id.as_str(), "unblocked": unblocked }))
}

async fn add_malicious_ip(state: web::Data<ApiState>, req: web::Json<MaliciousIpRequest>) -> impl Responder {
    let added = state.engine.add_known_malicious_ip(&req.ip);
    HttpResponse::Ok().json(serde_json::json!({ "ip": req.ip, "added": added }))
}

fn audit_error_response(e: AuditError) -> HttpResponse {
    match e {
        AuditError::UnsupportedFormat(_) | AuditError::InvalidRange { .. } => {
            HttpResponse::BadRequest().json(error_body(e.to_string()))
        }
        AuditError::Store(_) | AuditError::Serialization(_) => {
            error!("Audit request failed: {}", e);
            HttpResponse::ServiceUnavailable().json(error_body(e.to_string()))
        }
    }
}

async fn search_audit(state: web::Data<ApiState>, filter: web::Json<AuditFilter>) -> impl Responder {
    match state.audit.search(&filter).await {
        Ok(events) => HttpResponse::Ok().json(events),
        Err(e) => audit_error_response(e),
    }
}

async fn audit_report(state: web::Data<ApiState>, query: web::Query<ReportQuery>) -> impl Responder {
    match state.audit.generate_report(query.start, query.end).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => audit_error_response(e),
    }
}

async fn export_audit(state: web::Data<ApiState>, query: web::Query<ExportQuery>) -> impl Responder {
    let format = query.format.as_deref().unwrap_or("json");
    let content_type = match format.parse::<ExportFormat>() {
        Ok(ExportFormat::Json) => "application/json",
        Ok(ExportFormat::Csv) => "text/csv",
        Err(e) => return audit_error_response(e),
    };
    match state.audit.export(format).await {
        Ok(body) => HttpResponse::Ok().content_type(content_type).body(body),
        Err(e) => audit_error_response(e),
    }
}

async fn render_metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().json(error_body("metrics recorder not installed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alerting::LogAlertSink;
    use crate::core::clock::ManualClock;
    use crate::core::store::MemoryStore;
    use crate::core::{AuditEvent, Collaborators};
    use crate::models::{AuditSettings, Decision, EngineSettings, Statistics};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use chrono::TimeZone;
    use std::time::Duration;

    fn state() -> web::Data<ApiState> {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap()));
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
                store,
                alerts: Arc::new(LogAlertSink),
                audit: audit.clone(),
                store_timeout: Duration::from_millis(100),
            },
            EngineSettings::default(),
        ));
        web::Data::new(ApiState {
            engine,
            audit,
            metrics: None,
        })
    }

    fn check_body(client_id: &str, config_name: &str) -> CheckRequest {
        CheckRequest {
            client_id: client_id.to_string(),
            config_name: Some(config_name.to_string()),
            ip_address: Some("192.0.2.10".to_string()),
            user_agent: Some("curl/8.0".to_string()),
            metadata: None,
        }
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_check_returns_429_when_denied() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        for _ in 0..5 {
            let req = test::TestRequest::post()
                .uri("/api/v1/check")
                .set_json(check_body("login-1", "auth"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let req = test::TestRequest::post()
            .uri("/api/v1/check")
            .set_json(check_body("login-1", "auth"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("X-RateLimit-Remaining").unwrap(), "0");
        let decision: Decision = test::read_body_json(resp).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "rate limit exceeded");
    }

    #[actix_web::test]
    async fn test_policy_management() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(config)).await;

        let policy = RateLimitConfig {
            max_requests: 2,
            ..RateLimitConfig::default_policy()
        };
        let req = test::TestRequest::put()
            .uri("/api/v1/configs/tight")
            .set_json(&policy)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let invalid = RateLimitConfig {
            penalty_multiplier: 0.5,
            ..RateLimitConfig::default_policy()
        };
        let req = test::TestRequest::put()
            .uri("/api/v1/configs/broken")
            .set_json(&invalid)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/v1/configs").to_request();
        let configs: BTreeMap<String, RateLimitConfig> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(configs["tight"].max_requests, 2);
        assert!(!configs.contains_key("broken"));
    }

    #[actix_web::test]
    async fn test_block_and_unblock() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(config)).await;

        for _ in 0..6 {
            let req = test::TestRequest::post()
                .uri("/api/v1/check")
                .set_json(check_body("c9", "auth"))
                .to_request();
            test::call_service(&app, req).await;
        }
        assert!(data.engine.is_blocked("c9"));

        let req = test::TestRequest::get().uri("/api/v1/statistics").to_request();
        let stats: Statistics = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats.blocked_clients, 1);

        let req = test::TestRequest::post().uri("/api/v1/clients/c9/unblock").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["unblocked"], serde_json::json!(true));
        assert!(!data.engine.is_blocked("c9"));
    }

    #[actix_web::test]
    async fn test_threat_intel_and_response_time() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/threat-intel/ips")
            .set_json(MaliciousIpRequest {
                ip: "192.0.2.10".to_string(),
            })
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["added"], serde_json::json!(true));

        let req = test::TestRequest::post()
            .uri("/api/v1/check")
            .set_json(check_body("c1", "default"))
            .to_request();
        let decision: Decision = test::call_and_read_body_json(&app, req).await;
        assert_eq!(decision.risk_score, 50.0);

        let req = test::TestRequest::post()
            .uri("/api/v1/response-time")
            .set_json(ResponseTimeRequest {
                client_id: "c1".to_string(),
                millis: 120.0,
            })
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::post()
            .uri("/api/v1/response-time")
            .set_json(serde_json::json!({ "client_id": "c1", "millis": -4.0 }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_audit_endpoints() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/check")
            .set_json(check_body("c1", "auth"))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/audit/search")
            .set_json(AuditFilter::default())
            .to_request();
        let events: Vec<AuditEvent> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "auth_attempt");

        let req = test::TestRequest::get()
            .uri("/api/v1/audit/report?start=2024-07-01T00:00:00Z&end=2024-07-02T00:00:00Z")
            .to_request();
        let report: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(report["total_events"], serde_json::json!(1));

        let req = test::TestRequest::get()
            .uri("/api/v1/audit/report?start=2024-07-02T00:00:00Z&end=2024-07-01T00:00:00Z")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/v1/audit/export?format=csv").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/csv");
        let body = test::read_body(resp).await;
        assert!(std::str::from_utf8(&body).unwrap().starts_with("id,timestamp,event_type"));

        let req = test::TestRequest::get().uri("/api/v1/audit/export?format=xml").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert!(body.error.contains("xml"));
    }

    #[actix_web::test]
    async fn test_metrics_without_recorder() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;
        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
