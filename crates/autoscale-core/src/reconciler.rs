//! Keeps the running controllers in sync with the service inventory

use crate::controller::{ControllerContext, ServiceController};
use crate::error::{AutoscaleError, Result};
use crate::health::{ComponentHealth, HealthReporter};
use crate::inventory::ServiceValidator;
use crate::models::ServiceDescriptor;
use crate::workload::WorkloadAnalyserFactory;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ScheduledService {
    descriptor: ServiceDescriptor,
    controller: Arc<ServiceController>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl ScheduledService {
    /// Finished without being cancelled: the controller fail-stopped
    fn has_stopped(&self) -> bool {
        self.handle.is_finished() && !self.cancel.is_cancelled()
    }
}

/// Schedules one [`ServiceController`] task per discovered service
pub struct Reconciler {
    ctx: ControllerContext,
    factories: HashMap<String, Arc<dyn WorkloadAnalyserFactory>>,
    validator: Arc<dyn ServiceValidator>,
    initial_delay: Duration,
    delay_increment: Duration,
    root: CancellationToken,
    /// Held for the whole diff so concurrent updates never interleave
    scheduled: Mutex<HashMap<String, ScheduledService>>,
}

impl Reconciler {
    pub fn new(
        ctx: ControllerContext,
        factories: HashMap<String, Arc<dyn WorkloadAnalyserFactory>>,
        validator: Arc<dyn ServiceValidator>,
        initial_delay: Duration,
        delay_increment: Duration,
    ) -> Self {
        Self {
            ctx,
            factories,
            validator,
            initial_delay,
            delay_increment,
            root: CancellationToken::new(),
            scheduled: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile the scheduled controllers against `discovered`.
    ///
    /// Services that disappeared are cancelled and forgotten. New services,
    /// and services whose descriptor changed, get a fresh controller whose
    /// first tick is staggered by `delay_increment` within this pass.
    pub async fn update_services(&self, discovered: HashSet<ServiceDescriptor>) {
        let services = self.validator.validated_services(discovered);
        let mut scheduled = self.scheduled.lock().await;

        let to_cancel: Vec<String> = scheduled
            .keys()
            .filter(|id| !services.iter().any(|s| &s.id == *id))
            .cloned()
            .collect();
        for id in to_cancel {
            if let Some(service) = scheduled.remove(&id) {
                service.cancel.cancel();
            }
            self.ctx.governor.remove(&id);
            info!(event = "service_unscheduled", service = %id, "Stopped scaling service");
        }

        let mut to_schedule: Vec<ServiceDescriptor> = services
            .into_iter()
            .filter(|s| {
                scheduled
                    .get(&s.id)
                    .map(|current| current.descriptor != *s)
                    .unwrap_or(true)
            })
            .collect();
        to_schedule.sort_by(|a, b| a.id.cmp(&b.id));

        let mut delay = self.initial_delay;
        for descriptor in to_schedule {
            if let Some(previous) = scheduled.remove(&descriptor.id) {
                previous.cancel.cancel();
                debug!(service = %descriptor.id, "Descriptor changed, restarting controller");
            }

            let service = match self.schedule(&descriptor, delay) {
                Ok(service) => service,
                Err(e) => {
                    warn!(service = %descriptor.id, error = %e, "Service not scheduled");
                    self.ctx.governor.remove(&descriptor.id);
                    continue;
                }
            };

            info!(
                event = "service_scheduled",
                service = %descriptor.id,
                workload_metric = %descriptor.workload_metric,
                min_instances = descriptor.min_instances,
                max_instances = descriptor.max_instances,
                initial_delay_ms = delay.as_millis() as u64,
                "Scheduled scaling controller"
            );
            scheduled.insert(descriptor.id.clone(), service);
            delay += self.delay_increment;
        }

        self.ctx.metrics.set_scheduled_services(scheduled.len() as i64);
    }

    fn schedule(&self, descriptor: &ServiceDescriptor, delay: Duration) -> Result<ScheduledService> {
        let factory = self
            .factories
            .get(&descriptor.workload_metric)
            .ok_or_else(|| AutoscaleError::UnknownWorkloadMetric {
                service: descriptor.id.clone(),
                metric: descriptor.workload_metric.clone(),
            })?;
        let analyser = factory.analyser(
            &descriptor.scaling_target,
            descriptor.scaling_profile.as_deref(),
        );

        self.ctx.governor.register(descriptor);

        let cancel = self.root.child_token();
        let controller = ServiceController::new(
            descriptor.clone(),
            self.ctx.clone(),
            analyser,
            cancel.clone(),
        );
        self.ctx
            .governor
            .register_listener(&descriptor.id, controller.donor());

        let handle = tokio::spawn(controller.clone().run(delay));
        Ok(ScheduledService {
            descriptor: descriptor.clone(),
            controller,
            cancel,
            handle,
        })
    }

    pub async fn scheduled_count(&self) -> usize {
        self.scheduled.lock().await.len()
    }

    /// Scheduled service ids, sorted
    pub async fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scheduled.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Descriptor currently driving the controller of `service_id`
    pub async fn scheduled_descriptor(&self, service_id: &str) -> Option<ServiceDescriptor> {
        self.scheduled
            .lock()
            .await
            .get(service_id)
            .map(|service| service.controller.descriptor().clone())
    }

    /// Unhealthy while any controller has stopped on an unrecoverable error
    pub async fn health_check(&self) -> ComponentHealth {
        let scheduled = self.scheduled.lock().await;
        let mut stopped: Vec<&str> = scheduled
            .iter()
            .filter(|(_, service)| service.has_stopped())
            .map(|(id, _)| id.as_str())
            .collect();

        if stopped.is_empty() {
            return ComponentHealth::healthy();
        }
        stopped.sort_unstable();
        ComponentHealth::unhealthy(format!(
            "Scaling controllers have stopped running. The service must be restarted to continue scaling. Affected services: {}",
            stopped.join(", ")
        ))
    }

    /// Cancel every controller and wait for their tasks to end
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ScheduledService)> =
            self.scheduled.lock().await.drain().collect();
        self.root.cancel();

        for (id, service) in drained {
            self.ctx.governor.remove(&id);
            if let Err(e) = service.handle.await {
                warn!(service = %id, error = %e, "Scaling controller task panicked");
            }
        }
        self.ctx.metrics.set_scheduled_services(0);
        info!("All scaling controllers stopped");
    }
}

#[async_trait]
impl HealthReporter for Reconciler {
    async fn health_check(&self) -> ComponentHealth {
        Reconciler::health_check(self).await
    }
}
