use super::*;
use crate::alerting::AlertDispatcher;
use crate::config::{AlertDispatchSettings, ResourceMonitoringSettings};
use crate::models::ScalingAction;
use crate::test_support::{descriptor, FakeScaler, FixedProbe, RecordingDispatcher, ScriptedAnalyser};
use std::sync::atomic::{AtomicUsize, Ordering};

struct Harness {
    scaler: Arc<FakeScaler>,
    probe: Arc<FixedProbe>,
    dispatcher: Arc<RecordingDispatcher>,
    ctx: ControllerContext,
}

fn harness(scaler: Arc<FakeScaler>) -> Harness {
    let settings = ResourceMonitoringSettings::default();
    let metrics = AutoscaleMetrics::new();
    let probe = FixedProbe::new(10.0, Some(10_000));
    let dispatcher = RecordingDispatcher::new();
    let alerter = Alerter::new(
        vec![dispatcher.clone() as Arc<dyn AlertDispatcher>],
        &AlertDispatchSettings::default(),
        metrics.clone(),
    );

    let ctx = ControllerContext {
        governor: Arc::new(Governor::new(settings.shutdown_thresholds(), metrics.clone())),
        scaler: scaler.clone(),
        monitor: Arc::new(ResourceMonitor::new(probe.clone(), Duration::ZERO)),
        classifier: StageClassifier::new(&settings),
        thresholds: settings.shutdown_thresholds(),
        alerter: Arc::new(alerter),
        convergence: ConvergencePolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            settle_delay: Duration::from_millis(10),
            max_capacity_requests: 2,
        },
        metrics,
    };

    Harness {
        scaler,
        probe,
        dispatcher,
        ctx,
    }
}

impl Harness {
    fn controller(
        &self,
        service: ServiceDescriptor,
        script: Vec<Result<ScalingAction>>,
    ) -> (Arc<ServiceController>, Arc<AtomicUsize>) {
        self.ctx.governor.register(&service);
        let (analyser, calls) = ScriptedAnalyser::new(script);
        let controller = ServiceController::new(
            service,
            self.ctx.clone(),
            analyser,
            CancellationToken::new(),
        );
        self.ctx
            .governor
            .register_listener(&controller.descriptor().id, controller.donor());
        (controller, calls)
    }
}

#[test]
fn test_convergence_delays_double_up_to_cap() {
    let policy = ConvergencePolicy {
        attempts: 6,
        initial_delay: Duration::from_millis(1000),
        max_delay: Duration::from_millis(4000),
        settle_delay: Duration::ZERO,
        max_capacity_requests: 1,
    };
    let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 4000, 4000, 4000]);
}

#[test]
fn test_default_policy_matches_settings() {
    let policy = ConvergencePolicy::default();
    assert_eq!(policy.attempts, 6);
    assert_eq!(policy.settle_delay, Duration::from_millis(1000));
    assert_eq!(policy.delays().last(), Some(Duration::from_millis(16_000)));
}

#[tokio::test(start_paused = true)]
async fn test_scale_up_then_back_off() {
    let h = harness(FakeScaler::new());
    h.scaler.set_instances("svc", InstanceSnapshot::new(1, 0, 1, 0));

    let mut service = descriptor("svc", 0, 10);
    service.backoff_amount = 5;
    service.scale_up_backoff_amount = Some(2);
    let (controller, calls) = h.controller(
        service,
        vec![Ok(ScalingAction::scale_up(1)), Ok(ScalingAction::scale_up(1))],
    );

    controller.tick().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.scaler.instances("svc").running, 2);

    // Two ticks skipped, analysis resumes on the third
    controller.tick().await.unwrap();
    controller.tick().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    controller.tick().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.scaler.scale_up_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scale_down_records_refreshed_instances() {
    let h = harness(FakeScaler::new());
    h.scaler.set_instances("svc", InstanceSnapshot::new(3, 0, 3, 0));

    let mut service = descriptor("svc", 0, 10);
    service.backoff_amount = 1;
    let (controller, calls) = h.controller(service, vec![Ok(ScalingAction::scale_down(2))]);

    controller.tick().await.unwrap();
    assert_eq!(h.scaler.scale_down_calls(), 1);
    assert_eq!(h.scaler.instances("svc").running, 1);
    // desired 1 against the refreshed total of 1
    assert_eq!(h.ctx.governor.relative_difference("svc"), Some(1.0));

    controller.tick().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_governor_clamps_analyser_request() {
    let h = harness(FakeScaler::new());
    h.scaler.set_instances("svc", InstanceSnapshot::new(2, 0, 2, 0));
    let (controller, _) = h.controller(descriptor("svc", 2, 3), vec![Ok(ScalingAction::scale_up(5))]);

    controller.tick().await.unwrap();
    assert_eq!(h.scaler.instances("svc").running, 3);
}

#[tokio::test(start_paused = true)]
async fn test_stage_one_sheds_low_priority_service() {
    let h = harness(FakeScaler::new());
    h.probe.set(75.0, Some(10_000));
    h.scaler.set_instances("svc", InstanceSnapshot::new(3, 0, 3, 1));
    let (controller, calls) = h.controller(descriptor("svc", 1, 10), vec![Ok(ScalingAction::scale_up(2))]);

    controller.tick().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.scaler.scale_up_calls(), 0);
    assert_eq!(h.scaler.instances("svc").total(), 0);
    assert_eq!(h.dispatcher.messages(), vec!["memory at 75.00%".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_shedding_without_instances_issues_no_call() {
    let h = harness(FakeScaler::new());
    h.probe.set(95.0, Some(10_000));
    h.scaler.set_instances("svc", InstanceSnapshot::new(0, 0, 0, 2));
    let (controller, calls) = h.controller(descriptor("svc", 1, 10), Vec::new());

    controller.tick().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.scaler.scale_down_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_service_alerted_but_kept() {
    let h = harness(FakeScaler::new());
    h.probe.set(72.0, Some(150));
    h.scaler.set_instances("svc", InstanceSnapshot::new(2, 0, 2, 5));
    let (controller, calls) = h.controller(descriptor("svc", 1, 10), Vec::new());

    controller.tick().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.scaler.scale_down_calls(), 0);
    assert_eq!(
        h.dispatcher.messages(),
        vec!["memory at 72.00%".to_string(), "disk at 150.00 MB".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_opted_out_service_ignores_resource_limits() {
    let h = harness(FakeScaler::new());
    h.probe.set(95.0, Some(50));
    h.scaler.set_instances("svc", InstanceSnapshot::new(2, 0, 2, -1));
    let (controller, calls) = h.controller(descriptor("svc", 1, 10), Vec::new());

    controller.tick().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.scaler.scale_down_calls(), 0);
    assert!(h.dispatcher.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unconverged_scale_up_without_donor_fails() {
    let h = harness(FakeScaler::with_capacity(1));
    h.scaler.set_instances("svc", InstanceSnapshot::new(1, 0, 1, 0));
    let (controller, calls) = h.controller(descriptor("svc", 0, 5), vec![Ok(ScalingAction::scale_up(1))]);

    let err = controller.tick().await.unwrap_err();
    assert!(matches!(err, AutoscaleError::InsufficientCapacity(ref s) if s == "svc"));
    assert!(err.is_recoverable());

    // No backoff was entered
    controller.tick().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_donor_makes_room_for_scale_up() {
    let h = harness(FakeScaler::with_capacity(4));
    h.scaler.set_instances("a", InstanceSnapshot::new(1, 0, 1, 0));
    h.scaler.set_instances("b", InstanceSnapshot::new(3, 0, 3, 0));

    let (a, _) = h.controller(descriptor("a", 0, 5), vec![Ok(ScalingAction::scale_up(1))]);
    let (_b, _) = h.controller(descriptor("b", 1, 5), Vec::new());
    h.ctx
        .governor
        .record_instances("b", InstanceSnapshot::new(3, 0, 3, 0));

    a.tick().await.unwrap();

    assert_eq!(h.scaler.instances("a").running, 2);
    assert_eq!(h.scaler.instances("b").running, 2);
    assert_eq!(h.scaler.scale_down_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_convergence_wait_is_interrupted() {
    let h = harness(FakeScaler::with_capacity(1));
    h.scaler.set_instances("svc", InstanceSnapshot::new(1, 0, 1, 0));
    let (controller, _) = h.controller(descriptor("svc", 0, 5), vec![Ok(ScalingAction::scale_up(1))]);

    controller.cancel();
    let err = controller.tick().await.unwrap_err();
    assert!(matches!(err, AutoscaleError::Interrupted(_)));
    assert_eq!(h.scaler.scale_up_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_service_is_rejected() {
    let h = harness(FakeScaler::new());
    h.scaler.set_instances("svc", InstanceSnapshot::new(1, 0, 1, 0));
    let (analyser, _) = ScriptedAnalyser::new(vec![Ok(ScalingAction::scale_up(1))]);
    let controller = ServiceController::new(
        descriptor("svc", 0, 5),
        h.ctx.clone(),
        analyser,
        CancellationToken::new(),
    );

    let err = controller.tick().await.unwrap_err();
    assert!(matches!(err, AutoscaleError::NotRegistered(_)));
    assert_eq!(h.scaler.scale_up_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_internal_error() {
    let h = harness(FakeScaler::new());
    h.scaler.set_instances("svc", InstanceSnapshot::new(1, 0, 1, 0));
    let (controller, calls) = h.controller(
        descriptor("svc", 0, 5),
        vec![Err(AutoscaleError::Internal("broken invariant".into()))],
    );

    let result = controller.run(Duration::from_millis(5)).await;
    assert!(matches!(result, Err(AutoscaleError::Internal(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_survives_recoverable_errors_until_cancelled() {
    let h = harness(FakeScaler::new());
    h.scaler.set_instances("svc", InstanceSnapshot::new(1, 0, 1, 0));
    let (controller, calls) = h.controller(
        descriptor("svc", 0, 5),
        vec![
            Err(AutoscaleError::Telemetry("timeout".into())),
            Err(AutoscaleError::QueueNotFound("svc-in".into())),
        ],
    );

    let handle = tokio::spawn(controller.clone().run(Duration::ZERO));
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(calls.load(Ordering::SeqCst) >= 3);

    controller.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_scaler_read_failure_is_recoverable() {
    let h = harness(FakeScaler::new());
    h.scaler.fail_reads(true);
    let (controller, calls) = h.controller(descriptor("svc", 0, 5), Vec::new());

    let err = controller.tick().await.unwrap_err();
    assert!(matches!(err, AutoscaleError::Scaler(_)));
    assert!(err.is_recoverable());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
