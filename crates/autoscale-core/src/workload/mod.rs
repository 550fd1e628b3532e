//! Workload analysis
//!
//! A [`WorkloadAnalyser`] turns telemetry into a recommended [`ScalingAction`].
//! Analysers are created per service by a [`WorkloadAnalyserFactory`]
//! registered under a workload metric name. The bundled implementation
//! watches queue depth and throughput ([`queue`]).

pub mod queue;
mod window;

pub use queue::{
    QueueStatsSource, QueueWorkloadAnalyser, QueueWorkloadAnalyserFactory, QueueWorkloadProfile,
    QUEUE_METRIC,
};
pub use window::RollingWindow;

use crate::error::Result;
use crate::health::ComponentHealth;
use crate::models::{InstanceSnapshot, ScalingAction};
use async_trait::async_trait;

/// Per-service workload analyser; keeps its own rolling history
#[async_trait]
pub trait WorkloadAnalyser: Send + Sync {
    /// Recommend an action given the current instance counts
    async fn analyse_workload(&mut self, instances: &InstanceSnapshot) -> Result<ScalingAction>;

    /// Alert body for memory pressure; `used_percent` is preformatted
    fn memory_overload_warning(&self, used_percent: &str) -> String;

    /// Alert body for low disk; `free_mb` is preformatted
    fn disk_space_low_warning(&self, free_mb: &str) -> String;
}

/// Creates analysers for one workload metric
#[async_trait]
pub trait WorkloadAnalyserFactory: Send + Sync {
    fn analyser(&self, scaling_target: &str, profile: Option<&str>) -> Box<dyn WorkloadAnalyser>;

    async fn health_check(&self) -> ComponentHealth {
        ComponentHealth::healthy()
    }
}
