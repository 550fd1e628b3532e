//! Queue depth and throughput based workload analysis
//!
//! Samples of the target queue (and of any staging queues feeding it) are
//! averaged over `scaling_delay` ticks. The average consume rate gives a
//! per-worker throughput estimate, from which the number of workers needed
//! to drain the current backlog within `backlog_goal` seconds follows.

use super::{RollingWindow, WorkloadAnalyser, WorkloadAnalyserFactory};
use crate::config::{QueueAnalyserSettings, DEFAULT_PROFILE};
use crate::error::Result;
use crate::health::ComponentHealth;
use crate::models::{InstanceSnapshot, QueueStats, ScalingAction, StagingQueueStats};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Workload metric name the queue analyser factory is registered under
pub const QUEUE_METRIC: &str = "queue";

/// Largest scale-up issued in one decision
const MAX_SCALE_UP: u32 = 5;

/// Telemetry source for queue statistics (e.g. a broker management API)
#[async_trait]
pub trait QueueStatsSource: Send + Sync {
    /// Fails with `QueueNotFound` when the queue does not exist
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats>;

    /// Statistics of every queue whose name matches the regex `pattern`
    async fn staging_queue_stats(&self, pattern: &str) -> Result<Vec<StagingQueueStats>>;

    async fn health_check(&self) -> ComponentHealth {
        ComponentHealth::healthy()
    }
}

/// Per-profile tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueWorkloadProfile {
    /// Ticks averaged before a decision
    pub scaling_delay: u32,
    /// Seconds within which the backlog should be drained
    pub backlog_goal: u32,
}

impl Default for QueueWorkloadProfile {
    fn default() -> Self {
        Self {
            scaling_delay: 10,
            backlog_goal: 300,
        }
    }
}

pub struct QueueWorkloadAnalyser {
    scaling_target: String,
    source: Arc<dyn QueueStatsSource>,
    profile: QueueWorkloadProfile,
    /// `None` when staging queues are not in use
    staging_pattern: Option<String>,
    target_samples: RollingWindow<QueueStats>,
    staging_samples: RollingWindow<Vec<StagingQueueStats>>,
    ticks: u32,
}

impl QueueWorkloadAnalyser {
    pub fn new(
        scaling_target: impl Into<String>,
        source: Arc<dyn QueueStatsSource>,
        profile: QueueWorkloadProfile,
        staging_queue_indicator: Option<&str>,
    ) -> Self {
        let scaling_target = scaling_target.into();
        let staging_pattern = staging_queue_indicator
            .map(|indicator| format!("^{}{}.+$", scaling_target, indicator));
        let window = profile.scaling_delay as usize;

        Self {
            scaling_target,
            source,
            profile,
            staging_pattern,
            target_samples: RollingWindow::new(window),
            staging_samples: RollingWindow::new(window),
            ticks: 0,
        }
    }

    pub fn staging_pattern(&self) -> Option<&str> {
        self.staging_pattern.as_deref()
    }

    async fn staging_stats(&self) -> Result<Vec<StagingQueueStats>> {
        match &self.staging_pattern {
            Some(pattern) => self.source.staging_queue_stats(pattern).await,
            None => Ok(Vec::new()),
        }
    }

    fn workers_needed(&self, backlog: u64, instances: &InstanceSnapshot) -> u32 {
        // Windows were just pushed to, so the means exist
        let consume = self.target_samples.mean_by(|s| s.consume_rate).unwrap_or(0.0);
        let publish = self.target_samples.mean_by(|s| s.publish_rate).unwrap_or(0.0);
        let target_avg = self.target_samples.mean_by(|s| s.messages as f64).unwrap_or(0.0);

        let staging_counts: Vec<f64> = self
            .staging_samples
            .iter()
            .flatten()
            .map(|s| s.messages as f64)
            .collect();
        let staging_avg = if staging_counts.is_empty() {
            0.0
        } else {
            staging_counts.iter().sum::<f64>() / staging_counts.len() as f64
        };
        let demand_avg = target_avg + staging_avg;

        debug!(
            target = %self.scaling_target,
            backlog,
            target_avg,
            staging_avg,
            consume,
            publish,
            running = instances.running,
            backlog_goal = self.profile.backlog_goal,
            "Queue workload averages"
        );

        if consume > 0.0 {
            let per_worker = consume / instances.running.max(1) as f64;
            let floor = if demand_avg > 0.0 { 1 } else { 0 };
            let needed = (backlog as f64 / self.profile.backlog_goal as f64 / per_worker).round();
            floor.max(needed as u32)
        } else if publish == 0.0 && demand_avg == 0.0 {
            0
        } else {
            // Work exists but nothing is consuming yet: hold steady
            instances.total().max(1)
        }
    }
}

#[async_trait]
impl WorkloadAnalyser for QueueWorkloadAnalyser {
    async fn analyse_workload(&mut self, instances: &InstanceSnapshot) -> Result<ScalingAction> {
        if instances.staging > 0 {
            return Ok(ScalingAction::NO_ACTION);
        }

        let target = self.source.queue_stats(&self.scaling_target).await?;
        let staging = self.staging_stats().await?;
        let backlog = target.messages + staging.iter().map(|s| s.messages).sum::<u64>();

        if backlog > 0 && instances.total() == 0 {
            debug!(target = %self.scaling_target, backlog, "Backlog with no instances, starting one");
            return Ok(ScalingAction::scale_up(1));
        }

        self.target_samples.push(target);
        self.staging_samples.push(staging);
        self.ticks += 1;
        if self.ticks < self.profile.scaling_delay {
            return Ok(ScalingAction::NO_ACTION);
        }
        self.ticks = 0;

        let needed = self.workers_needed(backlog, instances);
        let current = instances.total();
        debug!(target = %self.scaling_target, needed, current, "Workers needed to meet backlog goal");

        let action = if needed > current {
            ScalingAction::scale_up(MAX_SCALE_UP.min(needed - current))
        } else if needed < current {
            ScalingAction::scale_down(current - needed)
        } else {
            ScalingAction::NO_ACTION
        };
        Ok(action)
    }

    fn memory_overload_warning(&self, used_percent: &str) -> String {
        format!(
            "To whom it may concern,\n\
             The messaging platform serving queue {} is experiencing issues.\n\
             It has used {}% of its high watermark memory allowance.\n",
            self.scaling_target, used_percent
        )
    }

    fn disk_space_low_warning(&self, free_mb: &str) -> String {
        format!(
            "To whom it may concern,\n\
             The messaging platform serving queue {} is experiencing issues.\n\
             It has only {} MB of free disk space left.\n",
            self.scaling_target, free_mb
        )
    }
}

/// Builds queue analysers, resolving profiles by name
pub struct QueueWorkloadAnalyserFactory {
    source: Arc<dyn QueueStatsSource>,
    profiles: HashMap<String, QueueWorkloadProfile>,
    staging_queue_indicator: Option<String>,
}

impl QueueWorkloadAnalyserFactory {
    pub fn new(source: Arc<dyn QueueStatsSource>, settings: &QueueAnalyserSettings) -> Self {
        let profiles = settings
            .profiles
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    QueueWorkloadProfile {
                        scaling_delay: p.scaling_delay,
                        backlog_goal: p.backlog_goal,
                    },
                )
            })
            .collect();

        Self {
            source,
            profiles,
            staging_queue_indicator: settings.staging_queue_indicator.clone(),
        }
    }

    /// Named profile, else the default one
    pub fn profile(&self, name: Option<&str>) -> QueueWorkloadProfile {
        name.and_then(|n| self.profiles.get(n))
            .or_else(|| self.profiles.get(DEFAULT_PROFILE))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkloadAnalyserFactory for QueueWorkloadAnalyserFactory {
    fn analyser(&self, scaling_target: &str, profile: Option<&str>) -> Box<dyn WorkloadAnalyser> {
        Box::new(QueueWorkloadAnalyser::new(
            scaling_target,
            self.source.clone(),
            self.profile(profile),
            self.staging_queue_indicator.as_deref(),
        ))
    }

    async fn health_check(&self) -> ComponentHealth {
        self.source.health_check().await
    }
}
