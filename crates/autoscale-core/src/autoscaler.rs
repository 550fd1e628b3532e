//! Top-level wiring of the autoscaler
//!
//! [`AutoscaleCore`] ties the inventory source to the [`Reconciler`], wraps
//! the platform scaler in a [`ScalerDecorator`] that only acts while this
//! instance is elected, and publishes component health.

use crate::alerting::{AlertDispatcher, Alerter};
use crate::config::AutoscaleSettings;
use crate::controller::{ControllerContext, ConvergencePolicy};
use crate::error::{AutoscaleError, Result};
use crate::governor::Governor;
use crate::health::{components, ComponentHealth, HealthRegistry, HealthReporter};
use crate::inventory::{DescriptorValidator, ServiceSource};
use crate::observability::AutoscaleMetrics;
use crate::reconciler::Reconciler;
use crate::resource::{ResourceMonitor, ResourceProbe, StageClassifier};
use crate::scaler::{ScalerDecorator, ServiceScaler};
use crate::workload::WorkloadAnalyserFactory;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Manual trigger for re-reading the service inventory
#[async_trait]
pub trait ServiceRefresh: Send + Sync {
    /// Reconcile against the current inventory; returns the number of
    /// scheduled services
    async fn refresh_services(&self) -> Result<usize>;
}

struct SourceHealth(Arc<dyn ServiceSource>);

#[async_trait]
impl HealthReporter for SourceHealth {
    async fn health_check(&self) -> ComponentHealth {
        self.0.health_check().await
    }
}

struct ScalerHealth(Arc<ScalerDecorator>);

#[async_trait]
impl HealthReporter for ScalerHealth {
    async fn health_check(&self) -> ComponentHealth {
        self.0.health_check().await
    }
}

struct WorkloadHealth(Arc<dyn WorkloadAnalyserFactory>);

#[async_trait]
impl HealthReporter for WorkloadHealth {
    async fn health_check(&self) -> ComponentHealth {
        self.0.health_check().await
    }
}

/// The running autoscaler
pub struct AutoscaleCore {
    settings: AutoscaleSettings,
    source: Arc<dyn ServiceSource>,
    scaler: Arc<ScalerDecorator>,
    factories: HashMap<String, Arc<dyn WorkloadAnalyserFactory>>,
    reconciler: Arc<Reconciler>,
    health: HealthRegistry,
    cancel: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoscaleCore {
    /// Register health reporters, schedule the current inventory and start
    /// the periodic refresh
    pub async fn start(&self) {
        self.health
            .register_reporter(components::SOURCE, Arc::new(SourceHealth(self.source.clone())))
            .await;
        self.health
            .register_reporter(components::SCALER, Arc::new(ScalerHealth(self.scaler.clone())))
            .await;
        for (metric, factory) in &self.factories {
            self.health
                .register_reporter(
                    components::workload(metric),
                    Arc::new(WorkloadHealth(factory.clone())),
                )
                .await;
        }
        self.health
            .register_reporter(components::SCHEDULER, self.reconciler.clone())
            .await;
        self.health.register(components::REFRESH).await;

        if let Err(e) = refresh(self.source.as_ref(), &self.reconciler, &self.health).await {
            error!(error = %e, "Initial service refresh failed, retrying on the next period");
        }

        let period = self.settings.source_refresh_period();
        let task = tokio::spawn(refresh_loop(
            self.source.clone(),
            self.reconciler.clone(),
            self.health.clone(),
            period,
            self.cancel.child_token(),
        ));
        *self.refresh_task.lock().await = Some(task);

        self.health.set_ready(true).await;
        info!(
            event = "autoscaler_started",
            refresh_period_secs = period.as_secs(),
            active = self.scaler.is_active(),
            "Autoscaler started"
        );
    }

    /// This instance became leader: scaling commands take effect
    pub fn elected(&self) {
        self.scaler.set_active(true);
        info!(event = "leadership_acquired", "Scaling commands enabled");
    }

    /// This instance lost or never gained leadership
    pub fn rejected(&self) {
        self.scaler.set_active(false);
        info!(event = "leadership_lost", "Scaling commands disabled");
    }

    pub fn is_active(&self) -> bool {
        self.scaler.is_active()
    }

    pub fn health_registry(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Stop the refresh task and every controller
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.refresh_task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Service refresh task panicked");
            }
        }
        self.reconciler.shutdown().await;
        self.health.set_ready(false).await;
        info!("Autoscaler stopped");
    }
}

#[async_trait]
impl ServiceRefresh for AutoscaleCore {
    async fn refresh_services(&self) -> Result<usize> {
        refresh(self.source.as_ref(), &self.reconciler, &self.health).await
    }
}

async fn refresh(
    source: &dyn ServiceSource,
    reconciler: &Reconciler,
    health: &HealthRegistry,
) -> Result<usize> {
    let services = match source.get_services().await {
        Ok(services) => services,
        Err(e) => {
            health
                .set_degraded(components::REFRESH, format!("Inventory refresh failed: {}", e))
                .await;
            return Err(e);
        }
    };
    health.set_healthy(components::REFRESH).await;
    let discovered = services.len();
    reconciler.update_services(services).await;
    let scheduled = reconciler.scheduled_count().await;
    info!(discovered, scheduled, "Service inventory refreshed");
    Ok(scheduled)
}

async fn refresh_loop(
    source: Arc<dyn ServiceSource>,
    reconciler: Arc<Reconciler>,
    health: HealthRegistry,
    period: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {
                if let Err(e) = refresh(source.as_ref(), &reconciler, &health).await {
                    error!(error = %e, "Service refresh failed");
                }
            }
        }
    }
}

/// Builder for [`AutoscaleCore`]
pub struct AutoscaleCoreBuilder {
    settings: AutoscaleSettings,
    source: Option<Arc<dyn ServiceSource>>,
    scaler: Option<Arc<dyn ServiceScaler>>,
    resource_probe: Option<Arc<dyn ResourceProbe>>,
    factories: HashMap<String, Arc<dyn WorkloadAnalyserFactory>>,
    dispatchers: Vec<Arc<dyn AlertDispatcher>>,
    health: Option<HealthRegistry>,
    metrics: Option<AutoscaleMetrics>,
}

impl AutoscaleCoreBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            settings: AutoscaleSettings::default(),
            source: None,
            scaler: None,
            resource_probe: None,
            factories: HashMap::new(),
            dispatchers: Vec::new(),
            health: None,
            metrics: None,
        }
    }

    pub fn settings(mut self, settings: AutoscaleSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the service inventory
    pub fn source(mut self, source: Arc<dyn ServiceSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the platform scaler
    pub fn scaler(mut self, scaler: Arc<dyn ServiceScaler>) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn resource_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.resource_probe = Some(probe);
        self
    }

    /// Register an analyser factory under a workload metric name
    pub fn analyser_factory(
        mut self,
        metric: impl Into<String>,
        factory: Arc<dyn WorkloadAnalyserFactory>,
    ) -> Self {
        self.factories.insert(metric.into(), factory);
        self
    }

    pub fn alert_dispatcher(mut self, dispatcher: Arc<dyn AlertDispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    /// Share an existing health registry (e.g. with the HTTP API)
    pub fn health_registry(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: AutoscaleMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the autoscaler; scaling stays inactive until [`AutoscaleCore::elected`]
    pub fn build(self) -> Result<AutoscaleCore> {
        let source = self
            .source
            .ok_or_else(|| AutoscaleError::Config("Service source is required".into()))?;
        let scaler = self
            .scaler
            .ok_or_else(|| AutoscaleError::Config("Scaler is required".into()))?;
        let probe = self
            .resource_probe
            .ok_or_else(|| AutoscaleError::Config("Resource probe is required".into()))?;
        if self.factories.is_empty() {
            return Err(AutoscaleError::Config(
                "At least one workload analyser factory is required".into(),
            ));
        }
        self.settings.validate()?;

        let settings = self.settings;
        let metrics = self.metrics.unwrap_or_default();
        let resources = &settings.resource_monitoring;

        let scaler = Arc::new(ScalerDecorator::new(scaler, false));
        let ctx = ControllerContext {
            governor: Arc::new(Governor::new(
                resources.shutdown_thresholds(),
                metrics.clone(),
            )),
            scaler: scaler.clone(),
            monitor: Arc::new(ResourceMonitor::new(probe, resources.refresh_interval())),
            classifier: StageClassifier::new(resources),
            thresholds: resources.shutdown_thresholds(),
            alerter: Arc::new(Alerter::new(
                self.dispatchers,
                &settings.alert_dispatch,
                metrics.clone(),
            )),
            convergence: ConvergencePolicy::from_settings(&settings.convergence),
            metrics,
        };

        let validator = Arc::new(DescriptorValidator::new(self.factories.keys().cloned()));
        let reconciler = Arc::new(Reconciler::new(
            ctx,
            self.factories.clone(),
            validator,
            settings.initial_scaling_delay(),
            settings.scaling_delay_increment(),
        ));

        Ok(AutoscaleCore {
            settings,
            source,
            scaler,
            factories: self.factories,
            reconciler,
            health: self.health.unwrap_or_default(),
            cancel: CancellationToken::new(),
            refresh_task: Mutex::new(None),
        })
    }
}

impl Default for AutoscaleCoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
