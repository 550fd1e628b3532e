//! Resource limit stage classification

use crate::config::ResourceMonitoringSettings;
use crate::models::{ResourceLimitStage, ResourceLimitStagesReached, ResourceUtilisation};

/// Highest shutdown priority shed at each stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownThresholds {
    pub stage_one: i32,
    pub stage_two: i32,
    pub stage_three: i32,
}

impl ShutdownThresholds {
    pub fn threshold_for(&self, stage: ResourceLimitStage) -> Option<i32> {
        match stage {
            ResourceLimitStage::NoStage => None,
            ResourceLimitStage::Stage1 => Some(self.stage_one),
            ResourceLimitStage::Stage2 => Some(self.stage_two),
            ResourceLimitStage::Stage3 => Some(self.stage_three),
        }
    }

    /// True if a service with `shutdown_priority` must be shed at `stage`.
    /// Services reporting -1 have opted out and are never shed.
    pub fn should_shed(&self, stage: ResourceLimitStage, shutdown_priority: i32) -> bool {
        if shutdown_priority == crate::models::SHUTDOWN_OPT_OUT {
            return false;
        }
        self.threshold_for(stage)
            .map(|threshold| shutdown_priority <= threshold)
            .unwrap_or(false)
    }
}

/// Maps utilisation readings onto the configured stage ladders
#[derive(Debug, Clone)]
pub struct StageClassifier {
    memory_limits: [f64; 3],
    disk_free_limits_mb: [u64; 3],
    memory_alert_threshold: f64,
    disk_alert_threshold_mb: u64,
}

impl StageClassifier {
    pub fn new(settings: &ResourceMonitoringSettings) -> Self {
        Self {
            memory_limits: [
                settings.memory_limit_stage_one,
                settings.memory_limit_stage_two,
                settings.memory_limit_stage_three,
            ],
            disk_free_limits_mb: [
                settings.disk_free_mb_limit_stage_one,
                settings.disk_free_mb_limit_stage_two,
                settings.disk_free_mb_limit_stage_three,
            ],
            memory_alert_threshold: settings.memory_alert_threshold(),
            disk_alert_threshold_mb: settings.disk_alert_threshold_mb(),
        }
    }

    pub fn classify(&self, utilisation: &ResourceUtilisation) -> ResourceLimitStagesReached {
        ResourceLimitStagesReached::new(
            self.memory_stage(utilisation.memory_used_percent),
            utilisation
                .disk_free_mb
                .map(|free| self.disk_stage(free))
                .unwrap_or(ResourceLimitStage::NoStage),
        )
    }

    fn memory_stage(&self, used_percent: f64) -> ResourceLimitStage {
        let [one, two, three] = self.memory_limits;
        if used_percent >= three {
            ResourceLimitStage::Stage3
        } else if used_percent >= two {
            ResourceLimitStage::Stage2
        } else if used_percent >= one {
            ResourceLimitStage::Stage1
        } else {
            ResourceLimitStage::NoStage
        }
    }

    // Less free disk is worse, so the ladder runs downwards
    fn disk_stage(&self, free_mb: u64) -> ResourceLimitStage {
        let [one, two, three] = self.disk_free_limits_mb;
        if free_mb <= three {
            ResourceLimitStage::Stage3
        } else if free_mb <= two {
            ResourceLimitStage::Stage2
        } else if free_mb <= one {
            ResourceLimitStage::Stage1
        } else {
            ResourceLimitStage::NoStage
        }
    }

    pub fn memory_alert_due(&self, utilisation: &ResourceUtilisation) -> bool {
        utilisation.memory_used_percent >= self.memory_alert_threshold
    }

    pub fn disk_alert_due(&self, utilisation: &ResourceUtilisation) -> bool {
        matches!(utilisation.disk_free_mb, Some(free) if free <= self.disk_alert_threshold_mb)
    }
}
