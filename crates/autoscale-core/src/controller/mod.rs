//! Per-service scaling controller
//!
//! A [`ServiceController`] owns one service's workload analyser and backoff
//! state. Each tick reads resource pressure and instance counts, sheds the
//! service under resource exhaustion, and otherwise applies the analyser's
//! recommendation after the [`Governor`] has arbitrated it.

mod backoff;

#[cfg(test)]
mod tests;

pub use backoff::BackoffState;

use crate::alerting::{AlertCategory, Alerter};
use crate::config::ConvergenceSettings;
use crate::error::{AutoscaleError, Result};
use crate::governor::{CapacityDonor, Governor};
use crate::models::{
    InstanceSnapshot, ResourceLimitStagesReached, ResourceUtilisation, ScalingOperation,
    ServiceDescriptor,
};
use crate::observability::AutoscaleMetrics;
use crate::resource::{ResourceMonitor, ShutdownThresholds, StageClassifier};
use crate::scaler::ServiceScaler;
use crate::workload::WorkloadAnalyser;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polling schedule used while waiting for a scale-up to converge
#[derive(Debug, Clone)]
pub struct ConvergencePolicy {
    /// Instance-info polls per round
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Pause after a scale-down before re-reading instance counts
    pub settle_delay: Duration,
    /// Donor requests allowed before the scale-up is abandoned
    pub max_capacity_requests: u32,
}

impl ConvergencePolicy {
    pub fn from_settings(settings: &ConvergenceSettings) -> Self {
        Self {
            attempts: settings.attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
            max_capacity_requests: settings.max_capacity_requests,
        }
    }

    /// Doubling delays starting at `initial_delay`, capped at `max_delay`
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max_delay = self.max_delay;
        std::iter::successors(Some(self.initial_delay.min(max_delay)), move |delay| {
            Some(delay.saturating_mul(2).min(max_delay))
        })
        .take(self.attempts as usize)
    }
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self::from_settings(&ConvergenceSettings::default())
    }
}

/// Collaborators shared by every controller
#[derive(Clone)]
pub struct ControllerContext {
    pub governor: Arc<Governor>,
    pub scaler: Arc<dyn ServiceScaler>,
    pub monitor: Arc<ResourceMonitor>,
    pub classifier: StageClassifier,
    pub thresholds: ShutdownThresholds,
    pub alerter: Arc<Alerter>,
    pub convergence: ConvergencePolicy,
    pub metrics: AutoscaleMetrics,
}

/// Control loop for a single service
pub struct ServiceController {
    descriptor: ServiceDescriptor,
    ctx: ControllerContext,
    analyser: tokio::sync::Mutex<Box<dyn WorkloadAnalyser>>,
    backoff: Mutex<BackoffState>,
    cancel: CancellationToken,
}

impl ServiceController {
    pub fn new(
        descriptor: ServiceDescriptor,
        ctx: ControllerContext,
        analyser: Box<dyn WorkloadAnalyser>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            ctx,
            analyser: tokio::sync::Mutex::new(analyser),
            backoff: Mutex::new(BackoffState::new()),
            cancel,
        })
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Handle the governor keeps to ask this controller for capacity
    pub fn donor(self: &Arc<Self>) -> Weak<dyn CapacityDonor> {
        let weak: Weak<Self> = Arc::downgrade(self);
        weak
    }

    /// Interrupt pending waits and stop the run loop
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Tick until cancelled, starting after `initial_delay`.
    ///
    /// Recoverable tick failures are logged and the schedule continues. An
    /// unrecoverable one ends the loop and is returned.
    pub async fn run(self: Arc<Self>, initial_delay: Duration) -> Result<()> {
        let service = self.descriptor.id.as_str();
        info!(
            service = %service,
            interval_secs = self.descriptor.interval_secs,
            initial_delay_ms = initial_delay.as_millis() as u64,
            "Starting scaling controller"
        );

        if self.sleep(initial_delay).await.is_ok() {
            loop {
                let start = Instant::now();
                let result = self.tick().await;
                self.ctx
                    .metrics
                    .observe_tick_duration(start.elapsed().as_secs_f64());

                if let Err(e) = result {
                    if !e.is_recoverable() {
                        self.ctx.metrics.inc_tick_failure(false);
                        error!(
                            event = "controller_failed",
                            service = %service,
                            error = %e,
                            "Unrecoverable error, scaling stopped. The service must be restarted to resume scaling"
                        );
                        return Err(e);
                    }
                    self.ctx.metrics.inc_tick_failure(true);
                    self.log_tick_failure(&e);
                }

                if self.sleep(self.descriptor.interval()).await.is_err() {
                    break;
                }
            }
        }

        info!(service = %service, "Scaling controller stopped");
        Ok(())
    }

    /// Run one control cycle, unless the controller is backing off
    pub async fn tick(&self) -> Result<()> {
        let skip = self.backoff_state().should_skip(&self.descriptor);
        if skip {
            debug!(service = %self.descriptor.id, "Backing off, analysis skipped");
            return Ok(());
        }
        self.analyse().await
    }

    async fn analyse(&self) -> Result<()> {
        let service = self.descriptor.id.as_str();

        let utilisation = self.ctx.monitor.current().await?;
        let stages = self.ctx.classifier.classify(&utilisation);
        let instances = self.ctx.scaler.get_instance_info(service).await?;

        if !instances.is_opted_out()
            && self
                .handle_resource_limits(&utilisation, stages, &instances)
                .await?
        {
            return Ok(());
        }

        self.ctx.governor.record_instances(service, instances);
        let requested = self
            .analyser
            .lock()
            .await
            .analyse_workload(&instances)
            .await?;
        let action = self.ctx.governor.govern(service, requested, stages)?;

        debug!(
            service = %service,
            running = instances.running,
            staging = instances.staging,
            requested = %requested,
            action = %action,
            "Workload analysed"
        );

        if action.is_no_op() {
            return Ok(());
        }
        match action.operation {
            ScalingOperation::ScaleUp => self.scale_up(action.amount).await,
            ScalingOperation::ScaleDown => self.scale_down(action.amount).await,
            ScalingOperation::None => Ok(()),
        }
    }

    /// Dispatch pressure alerts and shed the service if its priority is
    /// covered by the current stage. Returns true when the tick is done.
    async fn handle_resource_limits(
        &self,
        utilisation: &ResourceUtilisation,
        stages: ResourceLimitStagesReached,
        instances: &InstanceSnapshot,
    ) -> Result<bool> {
        if self.ctx.classifier.memory_alert_due(utilisation) {
            let used = format!("{:.2}", utilisation.memory_used_percent);
            let message = self.analyser.lock().await.memory_overload_warning(&used);
            self.send_alert(AlertCategory::MemoryOverload, &message)
                .await;
        }
        if let Some(free_mb) = utilisation.disk_free_mb {
            if self.ctx.classifier.disk_alert_due(utilisation) {
                let free = format!("{:.2}", free_mb as f64);
                let message = self.analyser.lock().await.disk_space_low_warning(&free);
                self.send_alert(AlertCategory::DiskSpaceLow, &message).await;
            }
        }

        let stage = stages.highest();
        if !self
            .ctx
            .thresholds
            .should_shed(stage, instances.shutdown_priority)
        {
            return Ok(false);
        }

        let total = instances.total();
        if total == 0 {
            self.ctx
                .governor
                .record_instances(&self.descriptor.id, *instances);
            return Ok(true);
        }

        warn!(
            event = "resource_shutdown",
            service = %self.descriptor.id,
            stage = ?stage,
            shutdown_priority = instances.shutdown_priority,
            instances = total,
            "Resource limit reached, shutting down every instance"
        );
        self.ctx.metrics.inc_resource_shutdown();
        self.scale_down(total).await?;
        Ok(true)
    }

    async fn send_alert(&self, category: AlertCategory, message: &str) {
        if let Err(e) = self.ctx.alerter.dispatch_alert(category, message).await {
            warn!(
                service = %self.descriptor.id,
                category = %category,
                error = %e,
                "Failed to dispatch alert"
            );
        }
    }

    async fn scale_up(&self, amount: u32) -> Result<()> {
        let service = self.descriptor.id.as_str();
        info!(event = "scale_up", service = %service, amount, "Scaling up");

        self.ctx.scaler.scale_up(service, amount).await?;
        self.ctx
            .metrics
            .inc_scaling_operation(ScalingOperation::ScaleUp.as_str());

        self.await_convergence().await?;
        self.backoff_state().enter(ScalingOperation::ScaleUp);
        Ok(())
    }

    async fn scale_down(&self, amount: u32) -> Result<()> {
        let service = self.descriptor.id.as_str();
        info!(event = "scale_down", service = %service, amount, "Scaling down");

        self.ctx.scaler.scale_down(service, amount).await?;
        self.ctx
            .metrics
            .inc_scaling_operation(ScalingOperation::ScaleDown.as_str());

        self.sleep(self.ctx.convergence.settle_delay).await?;
        let instances = self.ctx.scaler.get_instance_info(service).await?;
        self.ctx.governor.record_instances(service, instances);

        self.backoff_state().enter(ScalingOperation::ScaleDown);
        Ok(())
    }

    /// Wait for registered instances to start, asking the governor for room
    /// after every round that times out
    async fn await_convergence(&self) -> Result<()> {
        let service = self.descriptor.id.as_str();
        let mut capacity_requests = 0;

        loop {
            if self.poll_until_converged().await? {
                return Ok(());
            }

            if capacity_requests >= self.ctx.convergence.max_capacity_requests {
                warn!(
                    service = %service,
                    capacity_requests,
                    "Scale-up still pending after every capacity request"
                );
                return Err(AutoscaleError::InsufficientCapacity(service.to_string()));
            }

            info!(service = %service, "Scale-up pending, asking for capacity");
            if !self
                .ctx
                .governor
                .free_up_resources_for_service(service)
                .await
            {
                return Err(AutoscaleError::InsufficientCapacity(service.to_string()));
            }
            capacity_requests += 1;
        }
    }

    async fn poll_until_converged(&self) -> Result<bool> {
        let service = self.descriptor.id.as_str();
        for delay in self.ctx.convergence.delays() {
            self.sleep(delay).await?;

            let instances = self.ctx.scaler.get_instance_info(service).await?;
            self.ctx.governor.record_instances(service, instances);
            if instances.has_converged() {
                return Ok(true);
            }
            debug!(
                service = %service,
                registered = instances.total_registered,
                running = instances.running,
                staging = instances.staging,
                "Waiting for instances to start"
            );
        }
        Ok(false)
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(AutoscaleError::Interrupted(self.descriptor.id.clone()))
            }
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn backoff_state(&self) -> MutexGuard<'_, BackoffState> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_tick_failure(&self, error: &AutoscaleError) {
        let service = self.descriptor.id.as_str();
        match error {
            AutoscaleError::QueueNotFound(queue) => {
                warn!(service = %service, queue = %queue, "Scaling target queue not found")
            }
            AutoscaleError::Interrupted(_) => {
                debug!(service = %service, "Scaling interrupted")
            }
            _ => error!(
                service = %service,
                kind = error.kind(),
                error = %error,
                "Scaling tick failed"
            ),
        }
    }
}

#[async_trait]
impl CapacityDonor for ServiceController {
    async fn scale_down_now(&self, amount: u32) -> Result<()> {
        info!(
            event = "capacity_release",
            service = %self.descriptor.id,
            amount,
            "Releasing capacity for another service"
        );
        self.scale_down(amount).await
    }
}
