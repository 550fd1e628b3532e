//! Autoscaler configuration
//!
//! Settings are read from an optional file and from environment variables
//! prefixed with `AUTOSCALER`, nested groups separated by `__`
//! (e.g. `AUTOSCALER__RESOURCE_MONITORING__MEMORY_LIMIT_STAGE_ONE=75`).

use crate::error::{AutoscaleError, Result};
use crate::resource::ShutdownThresholds;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Name of the profile used when a service names none, or an unknown one
pub const DEFAULT_PROFILE: &str = "default";

/// Top-level autoscaler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AutoscaleSettings {
    /// Seconds between two inventory refreshes
    #[serde(default = "default_source_refresh_period")]
    pub source_refresh_period_secs: u64,

    /// Base delay before the first tick of a newly scheduled service
    #[serde(default = "default_initial_scaling_delay")]
    pub initial_scaling_delay_secs: u64,

    /// Extra delay added per service scheduled in the same pass
    #[serde(default = "default_scaling_delay_increment")]
    pub scaling_delay_increment_secs: u64,

    #[serde(default)]
    pub resource_monitoring: ResourceMonitoringSettings,

    #[serde(default)]
    pub alert_dispatch: AlertDispatchSettings,

    #[serde(default)]
    pub convergence: ConvergenceSettings,

    #[serde(default)]
    pub queue_analyser: QueueAnalyserSettings,
}

/// Resource stage ladders, shutdown thresholds and alert thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceMonitoringSettings {
    #[serde(default = "default_memory_stage_one")]
    pub memory_limit_stage_one: f64,
    #[serde(default = "default_memory_stage_two")]
    pub memory_limit_stage_two: f64,
    #[serde(default = "default_memory_stage_three")]
    pub memory_limit_stage_three: f64,

    #[serde(default = "default_disk_stage_one")]
    pub disk_free_mb_limit_stage_one: u64,
    #[serde(default = "default_disk_stage_two")]
    pub disk_free_mb_limit_stage_two: u64,
    #[serde(default = "default_disk_stage_three")]
    pub disk_free_mb_limit_stage_three: u64,

    #[serde(default = "default_stage_one_shutdown")]
    pub resource_limit_one_shutdown_threshold: i32,
    #[serde(default = "default_stage_two_shutdown")]
    pub resource_limit_two_shutdown_threshold: i32,
    #[serde(default = "default_stage_three_shutdown")]
    pub resource_limit_three_shutdown_threshold: i32,

    /// Falls back to `memory_limit_stage_one`
    #[serde(default)]
    pub memory_alert_dispatch_threshold: Option<f64>,
    /// Falls back to `disk_free_mb_limit_stage_one`
    #[serde(default)]
    pub disk_alert_dispatch_threshold_mb: Option<u64>,

    /// How long a resource utilisation reading stays fresh
    #[serde(default = "default_resource_refresh_interval")]
    pub refresh_interval_secs: u64,
}

/// Outbound alert rate limiting
#[derive(Debug, Clone, Deserialize)]
pub struct AlertDispatchSettings {
    #[serde(default)]
    pub disable_alert_dispatch: bool,
    #[serde(default = "default_alert_frequency")]
    pub alert_dispatch_frequency_mins: u64,
}

/// Scale-up convergence wait
#[derive(Debug, Clone, Deserialize)]
pub struct ConvergenceSettings {
    #[serde(default = "default_convergence_attempts")]
    pub attempts: u32,
    #[serde(default = "default_convergence_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_convergence_max_delay")]
    pub max_delay_ms: u64,
    /// Pause after a scale-down before re-reading instance counts
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Donor requests allowed per scale-up before giving up
    #[serde(default = "default_max_capacity_requests")]
    pub max_capacity_requests: u32,
}

/// Tunables of the queue workload analyser
#[derive(Debug, Clone, Deserialize)]
pub struct QueueAnalyserSettings {
    #[serde(default = "default_profiles")]
    pub profiles: HashMap<String, QueueProfileSettings>,
    /// Separator between a target queue name and its staging queues
    #[serde(default)]
    pub staging_queue_indicator: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QueueProfileSettings {
    /// Samples averaged before a decision is made
    pub scaling_delay: u32,
    /// Seconds within which the current backlog should be drained
    pub backlog_goal: u32,
}

fn default_source_refresh_period() -> u64 {
    30
}

fn default_initial_scaling_delay() -> u64 {
    30
}

fn default_scaling_delay_increment() -> u64 {
    1
}

fn default_memory_stage_one() -> f64 {
    70.0
}

fn default_memory_stage_two() -> f64 {
    80.0
}

fn default_memory_stage_three() -> f64 {
    90.0
}

fn default_disk_stage_one() -> u64 {
    400
}

fn default_disk_stage_two() -> u64 {
    200
}

fn default_disk_stage_three() -> u64 {
    100
}

fn default_stage_one_shutdown() -> i32 {
    1
}

fn default_stage_two_shutdown() -> i32 {
    3
}

fn default_stage_three_shutdown() -> i32 {
    5
}

fn default_resource_refresh_interval() -> u64 {
    10
}

fn default_alert_frequency() -> u64 {
    20
}

fn default_convergence_attempts() -> u32 {
    6
}

fn default_convergence_initial_delay() -> u64 {
    1000
}

fn default_convergence_max_delay() -> u64 {
    16_000
}

fn default_settle_delay() -> u64 {
    1000
}

fn default_max_capacity_requests() -> u32 {
    3
}

fn default_profiles() -> HashMap<String, QueueProfileSettings> {
    let mut profiles = HashMap::new();
    profiles.insert(
        DEFAULT_PROFILE.to_string(),
        QueueProfileSettings {
            scaling_delay: 10,
            backlog_goal: 300,
        },
    );
    profiles
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            source_refresh_period_secs: default_source_refresh_period(),
            initial_scaling_delay_secs: default_initial_scaling_delay(),
            scaling_delay_increment_secs: default_scaling_delay_increment(),
            resource_monitoring: ResourceMonitoringSettings::default(),
            alert_dispatch: AlertDispatchSettings::default(),
            convergence: ConvergenceSettings::default(),
            queue_analyser: QueueAnalyserSettings::default(),
        }
    }
}

impl Default for ResourceMonitoringSettings {
    fn default() -> Self {
        Self {
            memory_limit_stage_one: default_memory_stage_one(),
            memory_limit_stage_two: default_memory_stage_two(),
            memory_limit_stage_three: default_memory_stage_three(),
            disk_free_mb_limit_stage_one: default_disk_stage_one(),
            disk_free_mb_limit_stage_two: default_disk_stage_two(),
            disk_free_mb_limit_stage_three: default_disk_stage_three(),
            resource_limit_one_shutdown_threshold: default_stage_one_shutdown(),
            resource_limit_two_shutdown_threshold: default_stage_two_shutdown(),
            resource_limit_three_shutdown_threshold: default_stage_three_shutdown(),
            memory_alert_dispatch_threshold: None,
            disk_alert_dispatch_threshold_mb: None,
            refresh_interval_secs: default_resource_refresh_interval(),
        }
    }
}

impl Default for AlertDispatchSettings {
    fn default() -> Self {
        Self {
            disable_alert_dispatch: false,
            alert_dispatch_frequency_mins: default_alert_frequency(),
        }
    }
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            attempts: default_convergence_attempts(),
            initial_delay_ms: default_convergence_initial_delay(),
            max_delay_ms: default_convergence_max_delay(),
            settle_delay_ms: default_settle_delay(),
            max_capacity_requests: default_max_capacity_requests(),
        }
    }
}

impl Default for QueueAnalyserSettings {
    fn default() -> Self {
        Self {
            profiles: default_profiles(),
            staging_queue_indicator: None,
        }
    }
}

impl ResourceMonitoringSettings {
    pub fn memory_alert_threshold(&self) -> f64 {
        self.memory_alert_dispatch_threshold
            .unwrap_or(self.memory_limit_stage_one)
    }

    pub fn disk_alert_threshold_mb(&self) -> u64 {
        self.disk_alert_dispatch_threshold_mb
            .unwrap_or(self.disk_free_mb_limit_stage_one)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn shutdown_thresholds(&self) -> ShutdownThresholds {
        ShutdownThresholds {
            stage_one: self.resource_limit_one_shutdown_threshold,
            stage_two: self.resource_limit_two_shutdown_threshold,
            stage_three: self.resource_limit_three_shutdown_threshold,
        }
    }
}

impl AlertDispatchSettings {
    pub fn frequency(&self) -> Duration {
        Duration::from_secs(self.alert_dispatch_frequency_mins.saturating_mul(60))
    }
}

impl AutoscaleSettings {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let settings: AutoscaleSettings = builder
            .add_source(
                ::config::Environment::with_prefix("AUTOSCALER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn source_refresh_period(&self) -> Duration {
        Duration::from_secs(self.source_refresh_period_secs)
    }

    pub fn initial_scaling_delay(&self) -> Duration {
        Duration::from_secs(self.initial_scaling_delay_secs)
    }

    pub fn scaling_delay_increment(&self) -> Duration {
        Duration::from_secs(self.scaling_delay_increment_secs)
    }

    /// Reject settings the control loops cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.source_refresh_period_secs == 0 {
            return Err(AutoscaleError::Config(
                "source_refresh_period_secs must be at least 1".into(),
            ));
        }

        let rm = &self.resource_monitoring;
        if !(rm.memory_limit_stage_one <= rm.memory_limit_stage_two
            && rm.memory_limit_stage_two <= rm.memory_limit_stage_three)
        {
            return Err(AutoscaleError::Config(
                "memory stage limits must be ascending (stage one <= two <= three)".into(),
            ));
        }
        if !(rm.disk_free_mb_limit_stage_one >= rm.disk_free_mb_limit_stage_two
            && rm.disk_free_mb_limit_stage_two >= rm.disk_free_mb_limit_stage_three)
        {
            return Err(AutoscaleError::Config(
                "disk free limits must be descending (stage one >= two >= three)".into(),
            ));
        }

        let qa = &self.queue_analyser;
        if !qa.profiles.contains_key(DEFAULT_PROFILE) {
            return Err(AutoscaleError::Config(format!(
                "queue analyser profiles must include a '{}' profile",
                DEFAULT_PROFILE
            )));
        }
        for (name, profile) in &qa.profiles {
            if profile.scaling_delay == 0 || profile.backlog_goal == 0 {
                return Err(AutoscaleError::Config(format!(
                    "profile '{}' must have scaling_delay and backlog_goal of at least 1",
                    name
                )));
            }
        }
        if matches!(&qa.staging_queue_indicator, Some(indicator) if indicator.is_empty()) {
            return Err(AutoscaleError::Config(
                "staging_queue_indicator must not be empty when set".into(),
            ));
        }

        if self.convergence.attempts == 0 {
            return Err(AutoscaleError::Config(
                "convergence attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
