//! Hand-written fakes shared by the unit tests

use crate::alerting::AlertDispatcher;
use crate::error::{AutoscaleError, Result};
use crate::inventory::ServiceSource;
use crate::models::{
    InstanceSnapshot, QueueStats, ResourceUtilisation, ScalingAction, ServiceDescriptor,
    StagingQueueStats,
};
use crate::resource::ResourceProbe;
use crate::scaler::ServiceScaler;
use crate::workload::{QueueStatsSource, WorkloadAnalyser, WorkloadAnalyserFactory};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Descriptor with a 1s interval, no backoff and the queue metric
pub fn descriptor(id: &str, min: u32, max: u32) -> ServiceDescriptor {
    ServiceDescriptor {
        id: id.to_string(),
        interval_secs: 1,
        min_instances: min,
        max_instances: max,
        backoff_amount: 0,
        scale_up_backoff_amount: None,
        scale_down_backoff_amount: None,
        workload_metric: "queue".to_string(),
        scaling_target: format!("{}-in", id),
        scaling_profile: None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FakeService {
    running: u32,
    /// Registered but waiting for capacity
    pending: u32,
    shutdown_priority: i32,
}

/// Platform scaler with an optional global capacity.
///
/// Scale-ups register instances that start only while total running
/// instances stay within capacity; pending instances are promoted whenever
/// instance info is read.
pub struct FakeScaler {
    services: Mutex<HashMap<String, FakeService>>,
    capacity: Option<u32>,
    scale_up_calls: AtomicUsize,
    scale_down_calls: AtomicUsize,
    info_reads: Mutex<HashMap<String, usize>>,
    fail_reads: AtomicBool,
}

impl FakeScaler {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn with_capacity(capacity: u32) -> Arc<Self> {
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            services: Mutex::new(HashMap::new()),
            capacity,
            scale_up_calls: AtomicUsize::new(0),
            scale_down_calls: AtomicUsize::new(0),
            info_reads: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
        })
    }

    pub fn set_instances(&self, id: &str, snapshot: InstanceSnapshot) {
        self.services.lock().unwrap().insert(
            id.to_string(),
            FakeService {
                running: snapshot.running,
                pending: snapshot.total_registered.saturating_sub(snapshot.total()),
                shutdown_priority: snapshot.shutdown_priority,
            },
        );
    }

    pub fn instances(&self, id: &str) -> InstanceSnapshot {
        let services = self.services.lock().unwrap();
        let service = services.get(id).copied().unwrap_or_default();
        Self::snapshot(&service)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn scale_up_calls(&self) -> usize {
        self.scale_up_calls.load(Ordering::SeqCst)
    }

    pub fn scale_down_calls(&self) -> usize {
        self.scale_down_calls.load(Ordering::SeqCst)
    }

    /// Number of instance info reads for one service
    pub fn info_reads(&self, id: &str) -> usize {
        self.info_reads.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn snapshot(service: &FakeService) -> InstanceSnapshot {
        InstanceSnapshot::new(
            service.running,
            0,
            service.running + service.pending,
            service.shutdown_priority,
        )
    }

    fn promote_pending(&self, services: &mut HashMap<String, FakeService>) {
        let mut free = match self.capacity {
            Some(capacity) => {
                capacity.saturating_sub(services.values().map(|s| s.running).sum::<u32>())
            }
            None => u32::MAX,
        };
        let mut ids: Vec<String> = services.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Some(service) = services.get_mut(&id) {
                let started = service.pending.min(free);
                service.pending -= started;
                service.running += started;
                free -= started;
            }
        }
    }
}

#[async_trait]
impl ServiceScaler for FakeScaler {
    async fn scale_up(&self, service_id: &str, amount: u32) -> Result<()> {
        self.scale_up_calls.fetch_add(1, Ordering::SeqCst);
        let mut services = self.services.lock().unwrap();
        services.entry(service_id.to_string()).or_default().pending += amount;
        self.promote_pending(&mut services);
        Ok(())
    }

    async fn scale_down(&self, service_id: &str, amount: u32) -> Result<()> {
        self.scale_down_calls.fetch_add(1, Ordering::SeqCst);
        let mut services = self.services.lock().unwrap();
        let service = services.entry(service_id.to_string()).or_default();
        let from_pending = service.pending.min(amount);
        service.pending -= from_pending;
        service.running = service.running.saturating_sub(amount - from_pending);
        Ok(())
    }

    async fn get_instance_info(&self, service_id: &str) -> Result<InstanceSnapshot> {
        *self
            .info_reads
            .lock()
            .unwrap()
            .entry(service_id.to_string())
            .or_default() += 1;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AutoscaleError::Scaler("platform unavailable".into()));
        }
        let mut services = self.services.lock().unwrap();
        self.promote_pending(&mut services);
        services
            .get(service_id)
            .map(Self::snapshot)
            .ok_or_else(|| AutoscaleError::Scaler(format!("unknown service {}", service_id)))
    }
}

/// Resource probe returning a settable reading
pub struct FixedProbe {
    reading: Mutex<ResourceUtilisation>,
    calls: AtomicUsize,
}

impl FixedProbe {
    pub fn new(memory_used_percent: f64, disk_free_mb: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            reading: Mutex::new(ResourceUtilisation {
                memory_used_percent,
                disk_free_mb,
            }),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, memory_used_percent: f64, disk_free_mb: Option<u64>) {
        *self.reading.lock().unwrap() = ResourceUtilisation {
            memory_used_percent,
            disk_free_mb,
        };
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceProbe for FixedProbe {
    async fn resource_utilisation(&self) -> Result<ResourceUtilisation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.reading.lock().unwrap())
    }
}

/// Queue telemetry replaying a script; the last sample repeats once exhausted
pub struct ScriptedQueueSource {
    script: Mutex<VecDeque<QueueStats>>,
    staging: Mutex<Vec<StagingQueueStats>>,
    last_pattern: Mutex<Option<String>>,
    missing_queue: AtomicBool,
    queue_calls: AtomicUsize,
}

impl ScriptedQueueSource {
    pub fn new(script: Vec<QueueStats>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            staging: Mutex::new(Vec::new()),
            last_pattern: Mutex::new(None),
            missing_queue: AtomicBool::new(false),
            queue_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_staging(&self, staging: Vec<StagingQueueStats>) {
        *self.staging.lock().unwrap() = staging;
    }

    pub fn fail_with_missing_queue(&self, missing: bool) {
        self.missing_queue.store(missing, Ordering::SeqCst);
    }

    pub fn last_staging_pattern(&self) -> Option<String> {
        self.last_pattern.lock().unwrap().clone()
    }

    pub fn queue_calls(&self) -> usize {
        self.queue_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueStatsSource for ScriptedQueueSource {
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_queue.load(Ordering::SeqCst) {
            return Err(AutoscaleError::QueueNotFound(queue.to_string()));
        }
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        Ok(next.unwrap_or(QueueStats {
            messages: 0,
            publish_rate: 0.0,
            consume_rate: 0.0,
        }))
    }

    async fn staging_queue_stats(&self, pattern: &str) -> Result<Vec<StagingQueueStats>> {
        *self.last_pattern.lock().unwrap() = Some(pattern.to_string());
        Ok(self.staging.lock().unwrap().clone())
    }
}

/// Analyser replaying scripted results, then recommending nothing
pub struct ScriptedAnalyser {
    script: VecDeque<Result<ScalingAction>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedAnalyser {
    pub fn new(script: Vec<Result<ScalingAction>>) -> (Box<dyn WorkloadAnalyser>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let analyser = Self {
            script: script.into(),
            calls: calls.clone(),
        };
        (Box::new(analyser), calls)
    }
}

#[async_trait]
impl WorkloadAnalyser for ScriptedAnalyser {
    async fn analyse_workload(&mut self, _instances: &InstanceSnapshot) -> Result<ScalingAction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .pop_front()
            .unwrap_or(Ok(ScalingAction::NO_ACTION))
    }

    fn memory_overload_warning(&self, used_percent: &str) -> String {
        format!("memory at {}%", used_percent)
    }

    fn disk_space_low_warning(&self, free_mb: &str) -> String {
        format!("disk at {} MB", free_mb)
    }
}

/// Factory whose analysers always give the same answer
pub struct StaticAnalyserFactory {
    action: ScalingAction,
    /// Analysers fail every call with an internal error
    broken: bool,
    created: AtomicUsize,
}

impl StaticAnalyserFactory {
    pub fn new(action: ScalingAction) -> Arc<Self> {
        Arc::new(Self {
            action,
            broken: false,
            created: AtomicUsize::new(0),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            action: ScalingAction::NO_ACTION,
            broken: true,
            created: AtomicUsize::new(0),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkloadAnalyserFactory for StaticAnalyserFactory {
    fn analyser(&self, _scaling_target: &str, _profile: Option<&str>) -> Box<dyn WorkloadAnalyser> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(StaticAnalyser {
            action: self.action,
            broken: self.broken,
        })
    }
}

struct StaticAnalyser {
    action: ScalingAction,
    broken: bool,
}

#[async_trait]
impl WorkloadAnalyser for StaticAnalyser {
    async fn analyse_workload(&mut self, _instances: &InstanceSnapshot) -> Result<ScalingAction> {
        if self.broken {
            return Err(AutoscaleError::Internal("analyser state corrupted".into()));
        }
        Ok(self.action)
    }

    fn memory_overload_warning(&self, used_percent: &str) -> String {
        format!("memory at {}%", used_percent)
    }

    fn disk_space_low_warning(&self, free_mb: &str) -> String {
        format!("disk at {} MB", free_mb)
    }
}

/// Alert transport remembering every message
#[derive(Default)]
pub struct RecordingDispatcher {
    messages: Mutex<Vec<String>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: &str) -> Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Inventory returning whatever set was last configured
pub struct FakeSource {
    services: Mutex<HashSet<ServiceDescriptor>>,
    fail: AtomicBool,
}

impl FakeSource {
    pub fn new(services: Vec<ServiceDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            services: Mutex::new(services.into_iter().collect()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set(&self, services: Vec<ServiceDescriptor>) {
        *self.services.lock().unwrap() = services.into_iter().collect();
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceSource for FakeSource {
    async fn get_services(&self) -> Result<HashSet<ServiceDescriptor>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AutoscaleError::Telemetry("inventory unavailable".into()));
        }
        Ok(self.services.lock().unwrap().clone())
    }
}
