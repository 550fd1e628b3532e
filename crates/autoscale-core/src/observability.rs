//! Observability infrastructure for the autoscaler
//!
//! Provides:
//! - Prometheus metrics (tick latency, scaling operations, failures, shedding, alerts)
//! - Structured logging setup with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Histogram buckets for tick durations (in seconds); convergence waits run long
const TICK_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AutoscaleMetricsInner> = OnceLock::new();

struct AutoscaleMetricsInner {
    tick_duration_seconds: Histogram,
    scaling_operations: IntCounterVec,
    tick_failures: IntCounterVec,
    governor_overrides: IntCounter,
    resource_shutdowns: IntCounter,
    alerts_dispatched: IntCounterVec,
    scheduled_services: IntGauge,
}

impl AutoscaleMetricsInner {
    fn new() -> Self {
        Self {
            tick_duration_seconds: register_histogram!(
                "autoscaler_tick_duration_seconds",
                "Time spent in one controller tick",
                TICK_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),

            scaling_operations: register_int_counter_vec!(
                "autoscaler_scaling_operations_total",
                "Scaling operations issued to the platform scaler",
                &["operation"]
            )
            .expect("Failed to register scaling_operations_total"),

            tick_failures: register_int_counter_vec!(
                "autoscaler_tick_failures_total",
                "Controller ticks that ended in an error",
                &["kind"]
            )
            .expect("Failed to register tick_failures_total"),

            governor_overrides: register_int_counter!(
                "autoscaler_governor_overrides_total",
                "Requested actions changed by the governor"
            )
            .expect("Failed to register governor_overrides_total"),

            resource_shutdowns: register_int_counter!(
                "autoscaler_resource_shutdowns_total",
                "Services forced to zero because of resource pressure"
            )
            .expect("Failed to register resource_shutdowns_total"),

            alerts_dispatched: register_int_counter_vec!(
                "autoscaler_alerts_dispatched_total",
                "Alerts sent through the configured dispatchers",
                &["category"]
            )
            .expect("Failed to register alerts_dispatched_total"),

            scheduled_services: register_int_gauge!(
                "autoscaler_scheduled_services",
                "Services with a running controller"
            )
            .expect("Failed to register scheduled_services"),
        }
    }
}

/// Autoscaler metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct AutoscaleMetrics {
    _private: (),
}

impl Default for AutoscaleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoscaleMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AutoscaleMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AutoscaleMetricsInner {
        GLOBAL_METRICS.get_or_init(AutoscaleMetricsInner::new)
    }

    pub fn observe_tick_duration(&self, duration_secs: f64) {
        self.inner().tick_duration_seconds.observe(duration_secs);
    }

    /// Count an operation issued to the scaler (`scale_up` / `scale_down`)
    pub fn inc_scaling_operation(&self, operation: &str) {
        self.inner()
            .scaling_operations
            .with_label_values(&[operation])
            .inc();
    }

    pub fn inc_tick_failure(&self, recoverable: bool) {
        let kind = if recoverable { "recoverable" } else { "fatal" };
        self.inner().tick_failures.with_label_values(&[kind]).inc();
    }

    pub fn inc_governor_override(&self) {
        self.inner().governor_overrides.inc();
    }

    pub fn inc_resource_shutdown(&self) {
        self.inner().resource_shutdowns.inc();
    }

    pub fn inc_alert_dispatched(&self, category: &str) {
        self.inner()
            .alerts_dispatched
            .with_label_values(&[category])
            .inc();
    }

    pub fn set_scheduled_services(&self, count: i64) {
        self.inner().scheduled_services.set(count);
    }
}

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG` and defaults to `info`. Returns false if a
/// subscriber was already installed.
pub fn init_tracing(json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = json.then(|| fmt::layer().json());
    let plain_layer = (!json).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .try_init()
        .is_ok()
}
