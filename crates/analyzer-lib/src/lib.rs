//! Adaptive traffic engineering for INT-instrumented SRv6 networks
//!
//! This crate provides the core functionality for:
//! - Windowed telemetry queries against the metrics store
//! - Normalization and MCDA load scoring of switches and flows
//! - Overload/recovery detection with hysteresis
//! - QoS-aware detour selection and controller rule management
//! - Health checks and observability

pub mod control;
pub mod detour;
pub mod gateway;
pub mod health;
pub mod models;
pub mod observability;
pub mod scoring;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AnalyzerMetrics, StructuredLogger};
