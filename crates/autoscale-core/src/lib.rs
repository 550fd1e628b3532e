//! Autoscaling control plane
//!
//! This crate provides:
//! - Per-service control loops driven by workload analysis
//! - A governor arbitrating scaling decisions across services
//! - Staged shedding under platform resource exhaustion
//! - Reconciliation of running control loops against the service inventory
//! - Health checks and observability

pub mod alerting;
pub mod autoscaler;
pub mod config;
pub mod controller;
pub mod error;
pub mod governor;
pub mod health;
pub mod inventory;
pub mod models;
pub mod observability;
pub mod reconciler;
pub mod resource;
pub mod scaler;
pub mod workload;

#[cfg(test)]
mod test_support;

pub use autoscaler::{AutoscaleCore, AutoscaleCoreBuilder, ServiceRefresh};
pub use error::{AutoscaleError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::AutoscaleMetrics;
