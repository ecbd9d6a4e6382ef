//! Adaptive admission control.
//!
//! Per-client sliding-window rate limiting driven by risk and behaviour
//! signals, a temporary blocklist with escalating penalties, system-wide DDoS
//! detection and a tamper-evident audit trail.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
