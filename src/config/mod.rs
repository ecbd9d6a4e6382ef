//! Configuration management for the admission service.
//!
//! This module handles loading application settings from an optional
//! configuration file layered under `ADMISSION__*` environment variables.

use std::env;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use crate::models::{RateLimitConfig, Settings};

/// Load settings from the configuration file and environment variables
pub fn load_config() -> Result<Settings, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
    build(ConfigBuilder::builder().add_source(File::with_name(&config_file).required(false)))
}

fn build(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<Settings, ConfigError> {
    let config = builder
        .add_source(Environment::with_prefix("ADMISSION").separator("__"))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("storage.backend", "memory")?
        .set_default("storage.timeout_ms", 2000)?
        .set_default("engine.sweep_interval_secs", 300)?
        .set_default("engine.ddos_window_secs", 300)?
        .set_default("engine.profile_ttl_secs", 7 * 24 * 60 * 60)?
        .set_default("engine.active_window_secs", 300)?
        .set_default("engine.auto_block_secs", 3600)?
        .set_default("engine.load_capacity_rps", 100.0)?
        .set_default("engine.top_risk_clients", 10)?
        .set_default("engine.max_history_per_client", 10_000)?
        .set_default("audit.flush_interval_secs", 30)?
        .set_default("audit.max_events", 5000)?
        .set_default("audit.compress_threshold", 1000)?
        .set_default("audit.max_queue", 10_000)?
        .set_default("alerting.timeout_ms", 3000)?
        .build()?;

    let settings: Settings = config.try_deserialize()?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let mut policies = RateLimitConfig::builtin();
    policies.extend(settings.rate_limits.clone());
    for (name, policy) in &policies {
        if let Err(reason) = validate_policy(policy, settings.engine.max_history_per_client) {
            return Err(ConfigError::Message(format!("rate_limits.{}: {}", name, reason)));
        }
    }
    match settings.storage.backend.as_str() {
        "memory" | "redis" => Ok(()),
        other => Err(ConfigError::Message(format!("unknown storage backend '{}'", other))),
    }
}

/// Check the invariants every policy must hold. `max_history` is the
/// per-client history cap the window count is read from.
pub fn validate_policy(policy: &RateLimitConfig, max_history: usize) -> Result<(), String> {
    if policy.max_requests == 0 {
        return Err("max_requests must be at least 1".to_string());
    }
    if policy.window_seconds == 0 {
        return Err("window_seconds must be at least 1".to_string());
    }
    if !(policy.penalty_multiplier >= 1.0) {
        return Err("penalty_multiplier must be >= 1.0".to_string());
    }
    let peak = policy.peak_threshold();
    if peak >= max_history as u64 {
        return Err(format!(
            "admits up to {} requests per window, engine.max_history_per_client is {}",
            peak, max_history
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_defaults_without_file() {
        let settings = build(ConfigBuilder::builder()).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.storage.backend, "memory");
        assert_eq!(settings.audit.max_events, 5000);
        assert_eq!(settings.engine.profile_ttl_secs, 604_800);
        assert!(settings.rate_limits.is_empty());
    }

    #[test]
    fn test_policy_overrides_from_file() {
        let toml = r#"
            [rate_limits.search]
            window_seconds = 10
            max_requests = 20
            block_seconds = 30
            adaptive_scaling = true
            burst_allowance = 2
            penalty_multiplier = 1.5
        "#;
        let settings = build(ConfigBuilder::builder().add_source(File::from_str(toml, FileFormat::Toml))).unwrap();
        let search = &settings.rate_limits["search"];
        assert_eq!(search.max_requests, 20);
        assert!(search.adaptive_scaling);
    }

    #[test]
    fn test_rejects_invalid_penalty() {
        let toml = r#"
            [rate_limits.bad]
            window_seconds = 10
            max_requests = 20
            block_seconds = 30
            adaptive_scaling = false
            burst_allowance = 0
            penalty_multiplier = 0.5
        "#;
        let result = build(ConfigBuilder::builder().add_source(File::from_str(toml, FileFormat::Toml)));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_policy_wider_than_history() {
        let toml = r#"
            [engine]
            max_history_per_client = 50

            [rate_limits.wide]
            window_seconds = 60
            max_requests = 100
            block_seconds = 30
            adaptive_scaling = false
            burst_allowance = 0
            penalty_multiplier = 2.0
        "#;
        let result = build(ConfigBuilder::builder().add_source(File::from_str(toml, FileFormat::Toml)));
        assert!(matches!(result, Err(ConfigError::Message(ref m)) if m.starts_with("rate_limits.wide")));
    }

    #[test]
    fn test_adaptive_ceiling_counts_against_history() {
        let policy = RateLimitConfig {
            max_requests: 30,
            burst_allowance: 10,
            adaptive_scaling: true,
            ..RateLimitConfig::default_policy()
        };
        assert!(validate_policy(&policy, 71).is_ok());
        assert!(validate_policy(&policy, 70).is_err());
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let toml = r#"
            [storage]
            backend = "sqlite"
            timeout_ms = 100
        "#;
        let result = build(ConfigBuilder::builder().add_source(File::from_str(toml, FileFormat::Toml)));
        assert!(result.is_err());
    }
}
