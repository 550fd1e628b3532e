//! Core data models for the autoscaler

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Shutdown priority reported by services that opted out of forced shedding
pub const SHUTDOWN_OPT_OUT: i32 = -1;

/// A service eligible for autoscaling, as produced by the inventory source.
///
/// Descriptors are compared by value: any field change makes the reconciler
/// restart the service's controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    /// Seconds between two controller ticks
    pub interval_secs: u64,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Ticks skipped after any applied scaling operation
    pub backoff_amount: u32,
    #[serde(default)]
    pub scale_up_backoff_amount: Option<u32>,
    #[serde(default)]
    pub scale_down_backoff_amount: Option<u32>,
    /// Name of the workload analyser factory to use
    pub workload_metric: String,
    /// What the analyser inspects (e.g. the queue name)
    pub scaling_target: String,
    #[serde(default)]
    pub scaling_profile: Option<String>,
}

impl ServiceDescriptor {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Number of ticks to skip after `operation` was applied
    pub fn backoff_limit(&self, operation: ScalingOperation) -> u32 {
        let specific = match operation {
            ScalingOperation::ScaleUp => self.scale_up_backoff_amount,
            ScalingOperation::ScaleDown => self.scale_down_backoff_amount,
            ScalingOperation::None => None,
        };
        specific.unwrap_or(self.backoff_amount)
    }
}

/// Point-in-time instance counts for one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub running: u32,
    pub staging: u32,
    /// Instances the platform has registered, including ones not yet started
    pub total_registered: u32,
    /// Eligibility for forced shedding; `SHUTDOWN_OPT_OUT` opts out
    pub shutdown_priority: i32,
}

impl InstanceSnapshot {
    pub fn new(running: u32, staging: u32, total_registered: u32, shutdown_priority: i32) -> Self {
        Self {
            running,
            staging,
            total_registered,
            shutdown_priority,
        }
    }

    /// Running plus staging instances
    pub fn total(&self) -> u32 {
        self.running.saturating_add(self.staging)
    }

    pub fn is_opted_out(&self) -> bool {
        self.shutdown_priority == SHUTDOWN_OPT_OUT
    }

    /// True once every registered instance is running or staging
    pub fn has_converged(&self) -> bool {
        self.total_registered <= self.total()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingOperation {
    None,
    ScaleUp,
    ScaleDown,
}

impl ScalingOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingOperation::None => "none",
            ScalingOperation::ScaleUp => "scale_up",
            ScalingOperation::ScaleDown => "scale_down",
        }
    }
}

impl fmt::Display for ScalingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed or final scaling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingAction {
    pub operation: ScalingOperation,
    pub amount: u32,
}

impl ScalingAction {
    pub const NO_ACTION: ScalingAction = ScalingAction {
        operation: ScalingOperation::None,
        amount: 0,
    };

    pub fn scale_up(amount: u32) -> Self {
        Self {
            operation: ScalingOperation::ScaleUp,
            amount,
        }
    }

    pub fn scale_down(amount: u32) -> Self {
        Self {
            operation: ScalingOperation::ScaleDown,
            amount,
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.operation == ScalingOperation::None || self.amount == 0
    }
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} by {}", self.operation, self.amount)
    }
}

/// Platform-wide resource pressure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilisation {
    pub memory_used_percent: f64,
    #[serde(default)]
    pub disk_free_mb: Option<u64>,
}

/// Ordinal severity of resource pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLimitStage {
    NoStage,
    Stage1,
    Stage2,
    Stage3,
}

impl fmt::Display for ResourceLimitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceLimitStage::NoStage => "no_stage",
            ResourceLimitStage::Stage1 => "stage_1",
            ResourceLimitStage::Stage2 => "stage_2",
            ResourceLimitStage::Stage3 => "stage_3",
        };
        f.write_str(name)
    }
}

/// Stages reached independently by memory and disk pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitStagesReached {
    pub memory: ResourceLimitStage,
    pub disk: ResourceLimitStage,
}

impl ResourceLimitStagesReached {
    pub const NONE: ResourceLimitStagesReached = ResourceLimitStagesReached {
        memory: ResourceLimitStage::NoStage,
        disk: ResourceLimitStage::NoStage,
    };

    pub fn new(memory: ResourceLimitStage, disk: ResourceLimitStage) -> Self {
        Self { memory, disk }
    }

    /// Combined stage used for shedding decisions
    pub fn highest(&self) -> ResourceLimitStage {
        self.memory.max(self.disk)
    }
}

/// Statistics of the queue a service consumes from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub messages: u64,
    pub publish_rate: f64,
    pub consume_rate: f64,
}

/// Statistics of one staging queue feeding a target queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingQueueStats {
    pub name: String,
    pub messages: u64,
    pub publish_rate: f64,
}
