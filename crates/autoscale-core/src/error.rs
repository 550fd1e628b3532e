//! Error types for the autoscaler core

use thiserror::Error;

/// Result alias used throughout the autoscaler core
pub type Result<T> = std::result::Result<T, AutoscaleError>;

/// Errors raised while analysing, governing or applying scaling decisions
#[derive(Debug, Error)]
pub enum AutoscaleError {
    /// The platform scaler failed (API unreachable, request rejected, ...)
    #[error("scaler error: {0}")]
    Scaler(String),

    /// Workload or resource telemetry could not be fetched
    #[error("telemetry unavailable: {0}")]
    Telemetry(String),

    /// The queue backing a service does not exist
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A wait inside a tick was cancelled
    #[error("interrupted while waiting for service {0}")]
    Interrupted(String),

    /// Scale-up did not converge and no other service could give up capacity
    #[error("unable to make room for service {0} on the platform")]
    InsufficientCapacity(String),

    /// The governor was asked about a service that was never registered
    #[error("scaling configuration not found for {0}")]
    NotRegistered(String),

    /// A service requested a workload analyser that is not available
    #[error("invalid workload metric {metric} for service {service}")]
    UnknownWorkloadMetric { service: String, metric: String },

    /// Invalid or unloadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// An alert dispatcher failed to deliver a message
    #[error("alert dispatch failed: {0}")]
    Dispatch(String),

    /// Unexpected defect; stops the affected control loop permanently
    #[error("internal error: {0}")]
    Internal(String),
}

impl AutoscaleError {
    /// Returns true if the failure should only abort the current tick.
    ///
    /// Everything except `Internal` is recoverable; an internal error
    /// fail-stops the controller that raised it.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AutoscaleError::Internal(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AutoscaleError::Scaler(_) => "scaler",
            AutoscaleError::Telemetry(_) => "telemetry",
            AutoscaleError::QueueNotFound(_) => "queue_not_found",
            AutoscaleError::Interrupted(_) => "interrupted",
            AutoscaleError::InsufficientCapacity(_) => "insufficient_capacity",
            AutoscaleError::NotRegistered(_) => "not_registered",
            AutoscaleError::UnknownWorkloadMetric { .. } => "unknown_workload_metric",
            AutoscaleError::Config(_) => "config",
            AutoscaleError::Dispatch(_) => "dispatch",
            AutoscaleError::Internal(_) => "internal",
        }
    }
}

impl From<::config::ConfigError> for AutoscaleError {
    fn from(err: ::config::ConfigError) -> Self {
        AutoscaleError::Config(err.to_string())
    }
}
