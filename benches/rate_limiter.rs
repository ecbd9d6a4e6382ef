use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use admission_guard::core::alerting::LogAlertSink;
use admission_guard::core::{human_likelihood, AdmissionDecider, AuditLog, Collaborators, MemoryStore, SystemClock};
use admission_guard::models::{AuditSettings, EngineSettings, RequestContext, API_POLICY};

fn engine() -> AdmissionDecider {
    let clock = Arc::new(SystemClock::new());
    let store = Arc::new(MemoryStore::new());
    let audit = Arc::new(AuditLog::new(
        store.clone(),
        clock.clone(),
        Arc::new(LogAlertSink),
        AuditSettings::default(),
        Duration::from_millis(100),
    ));
    AdmissionDecider::new(
        Collaborators {
            clock,
            store,
            alerts: Arc::new(LogAlertSink),
            audit,
            store_timeout: Duration::from_millis(100),
        },
        EngineSettings::default(),
    )
}

fn check_benchmark(c: &mut Criterion) {
    let engine = engine();
    let ctx = RequestContext::with_ip("192.0.2.1");
    let mut n = 0u64;
    c.bench_function("admission_check", |b| {
        b.iter(|| {
            n += 1;
            let client = format!("client-{}", n % 1024);
            black_box(engine.check(&client, API_POLICY, &ctx))
        })
    });
}

fn human_likelihood_benchmark(c: &mut Criterion) {
    let intervals: Vec<f64> = (0..20).map(|i| 80.0 + ((i * 37) % 120) as f64).collect();
    c.bench_function("human_likelihood", |b| b.iter(|| human_likelihood(black_box(&intervals))));
}

criterion_group!(benches, check_benchmark, human_likelihood_benchmark);
criterion_main!(benches);
