// tests/coordinator.rs

//! End-to-end behaviour of the coordinator against scripted worker clients:
//! requeue without nodes, capacity bounds, health transitions, bounded
//! retries, draining and shutdown.

use agent::coordinator::{
    ClientError, Coordinator, CoordinatorConfig, CoordinatorError, HealthReport, NodeSpec,
    NodeStatus, WorkerClient, WorkerConnector,
};
use agent::governor::BreakerConfig;
use async_trait::async_trait;
use shared::{ProcessingResult, ProcessingTask, TaskType};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::sleep;

/// Worker whose latency, failures and health are set by the test.
struct Scripted {
    delay:   Duration,
    fail:    AtomicBool,
    health:  Mutex<Option<HealthReport>>,
    retries: Mutex<Vec<u32>>,
    calls:   AtomicUsize,
}

impl Scripted {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail: AtomicBool::new(false),
            health: Mutex::new(Some(HealthReport { load: 0.1, error_rate: 0.0, active: 0, capacity: 10 })),
            retries: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        let s = Self::new(Duration::ZERO);
        s.fail.store(true, Ordering::SeqCst);
        s
    }

    fn set_health(&self, report: Option<HealthReport>) {
        *self.health.lock().unwrap() = report;
    }
}

#[async_trait]
impl WorkerClient for Scripted {
    async fn process_batch(&self, tasks: &[ProcessingTask]) -> Result<Vec<ProcessingResult>, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.retries.lock().unwrap().extend(tasks.iter().map(|t| t.retry_count));
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("scripted failure".into()));
        }
        Ok(tasks.iter().map(|t| ProcessingResult::success(&t.id, "", Vec::new(), 10)).collect())
    }

    async fn health_check(&self) -> Result<HealthReport, ClientError> {
        self.health
            .lock()
            .unwrap()
            .ok_or_else(|| ClientError::Unavailable("scripted outage".into()))
    }

    async fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

struct NoConnect;

#[async_trait]
impl WorkerConnector for NoConnect {
    async fn connect(&self, node: &NodeSpec) -> Result<Arc<dyn WorkerClient>, ClientError> {
        Err(ClientError::Unavailable(node.address.clone()))
    }
}

fn fast_cfg() -> CoordinatorConfig {
    CoordinatorConfig {
        batch_timeout: Duration::from_millis(10),
        requeue_delay: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(10),
        // health passes are driven by hand
        health_check_interval: Duration::from_secs(3600),
        drain_poll: Duration::from_millis(10),
        ..CoordinatorConfig::default()
    }
}

fn task(key: &str) -> ProcessingTask {
    ProcessingTask::new(TaskType::Analyze, key, key.as_bytes().to_vec())
}

#[tokio::test]
async fn tasks_wait_for_a_node_with_growing_retry_count() {
    let c = Coordinator::start(fast_cfg(), Arc::new(NoConnect));
    c.submit(task("pid:7")).unwrap();

    sleep(Duration::from_millis(200)).await;
    let requeued = c.status().metrics.requeued;
    assert!(requeued >= 3, "requeued {requeued} times");
    assert!(c.next_result(Duration::from_millis(10)).await.is_none());

    let worker = Scripted::new(Duration::ZERO);
    c.register_client(NodeSpec::new("late", 4), worker.clone()).unwrap();

    let r = c.next_result(Duration::from_secs(2)).await.expect("task eventually served");
    assert!(r.success);
    assert_eq!(r.node_id, "late");
    let seen = worker.retries.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0] >= 3, "retry count {} after {requeued} requeues", seen[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_tasks_never_exceed_capacity() {
    let c = Coordinator::start(fast_cfg(), Arc::new(NoConnect));
    for id in ["a", "b", "c"] {
        c.register_client(NodeSpec::new(id, 10), Scripted::new(Duration::from_millis(50))).unwrap();
    }
    for i in 0..25 {
        c.submit(task(&format!("pid:{i}"))).unwrap();
    }

    let mut done = Vec::new();
    while done.len() < 25 {
        let status = c.status();
        assert!(status.active_tasks <= status.total_capacity);
        for n in &status.nodes {
            assert!(n.active <= n.capacity, "node {} at {}/{}", n.id, n.active, n.capacity);
        }
        match c.next_result(Duration::from_millis(5)).await {
            Some(r) => done.push(r),
            None => continue,
        }
    }
    assert!(done.iter().all(|r| r.success));

    let processed: u64 = c.nodes().iter().map(|n| n.processed()).sum();
    assert_eq!(processed, 25);
    assert_eq!(c.status().metrics.completed, 25);
    assert_eq!(c.status().active_tasks, 0);
}

#[tokio::test]
async fn health_reports_drive_node_status() {
    let cfg = CoordinatorConfig { node_timeout: Duration::from_millis(50), ..fast_cfg() };
    let c = Coordinator::start(cfg, Arc::new(NoConnect));
    let worker = Scripted::new(Duration::ZERO);
    c.register_client(NodeSpec::new("n1", 10), worker.clone()).unwrap();
    let node = c.node("n1").unwrap();

    worker.set_health(Some(HealthReport { load: 0.95, error_rate: 0.0, active: 9, capacity: 10 }));
    c.run_health_checks().await;
    assert_eq!(node.status(), NodeStatus::Degraded);
    assert!(node.is_routable());

    worker.set_health(None);
    c.run_health_checks().await;
    assert_eq!(node.status(), NodeStatus::Degraded);

    sleep(Duration::from_millis(80)).await;
    c.run_health_checks().await;
    assert_eq!(node.status(), NodeStatus::Offline);
    assert!(!node.is_routable());

    // offline nodes get no work
    c.submit(task("pid:1")).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    assert!(c.status().metrics.requeued >= 1);

    worker.set_health(Some(HealthReport::default()));
    c.run_health_checks().await;
    assert_eq!(node.status(), NodeStatus::Healthy);
    let r = c.next_result(Duration::from_secs(2)).await.unwrap();
    assert!(r.success);
}

#[tokio::test]
async fn failing_node_exhausts_retries() {
    let cfg = CoordinatorConfig {
        max_retries: 2,
        breaker: BreakerConfig { max_failures: 100, ..BreakerConfig::default() },
        ..fast_cfg()
    };
    let c = Coordinator::start(cfg, Arc::new(NoConnect));
    let worker = Scripted::failing();
    c.register_client(NodeSpec::new("bad", 10), worker.clone()).unwrap();
    c.submit(task("pid:3")).unwrap();

    let r = c.next_result(Duration::from_secs(2)).await.expect("terminal result");
    assert!(!r.success);
    let err = r.error.unwrap();
    assert!(err.starts_with("max retries exceeded"), "{err}");
    assert!(err.contains("scripted failure"), "{err}");

    assert_eq!(*worker.retries.lock().unwrap(), vec![0, 1, 2]);
    let m = c.status().metrics;
    assert_eq!(m.retried, 2);
    assert_eq!(m.dispatch_errors, 3);
    assert_eq!(m.failed, 1);
    assert_eq!(c.node("bad").unwrap().status(), NodeStatus::Degraded);
}

#[tokio::test]
async fn open_breaker_takes_node_out_of_rotation() {
    let cfg = CoordinatorConfig {
        breaker: BreakerConfig { max_failures: 1, reset_timeout: Duration::from_secs(60), half_open_limit: 1 },
        ..fast_cfg()
    };
    let c = Coordinator::start(cfg, Arc::new(NoConnect));
    let worker = Scripted::failing();
    c.register_client(NodeSpec::new("flaky", 10), worker.clone()).unwrap();
    c.submit(task("pid:9")).unwrap();

    sleep(Duration::from_millis(150)).await;
    let node = c.node("flaky").unwrap();
    assert!(!node.is_routable());
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    assert!(c.status().metrics.requeued >= 1);
    assert_eq!(c.status().nodes[0].breaker, "open");
}

#[tokio::test]
async fn drain_times_out_while_work_is_active() {
    let cfg = CoordinatorConfig { drain_timeout: Duration::from_millis(50), ..fast_cfg() };
    let c = Coordinator::start(cfg, Arc::new(NoConnect));
    c.register_client(NodeSpec::new("slow", 2), Scripted::new(Duration::from_millis(400))).unwrap();
    c.submit(task("pid:1")).unwrap();

    let node = c.node("slow").unwrap();
    while node.active() == 0 {
        sleep(Duration::from_millis(5)).await;
    }
    match c.unregister_node("slow").await {
        Err(CoordinatorError::DrainTimeout { id, active, .. }) => {
            assert_eq!(id, "slow");
            assert_eq!(active, 1);
        }
        other => panic!("expected drain timeout, got {other:?}"),
    }
    assert!(c.node("slow").is_some());
    assert!(!node.is_draining());

    assert!(c.next_result(Duration::from_secs(2)).await.unwrap().success);
    c.unregister_node("slow").await.unwrap();
    assert!(c.node("slow").is_none());
}

#[tokio::test]
async fn shutdown_fails_pending_requeues() {
    let c = Coordinator::start(
        CoordinatorConfig { requeue_delay: Duration::from_secs(30), ..fast_cfg() },
        Arc::new(NoConnect),
    );
    c.submit(task("pid:2")).unwrap();
    sleep(Duration::from_millis(50)).await;

    c.shutdown(Duration::from_secs(1)).await.unwrap();
    let r = c.next_result(Duration::from_millis(200)).await.expect("terminal result");
    assert!(!r.success);
    assert_eq!(r.error.as_deref(), Some("coordinator shut down before retry"));
    assert!(matches!(c.submit(task("late")), Err(CoordinatorError::ShuttingDown)));
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_batches() {
    let c = Coordinator::start(fast_cfg(), Arc::new(NoConnect));
    c.register_client(NodeSpec::new("n1", 10), Scripted::new(Duration::from_millis(100))).unwrap();
    for i in 0..5 {
        c.submit(task(&format!("pid:{i}"))).unwrap();
    }
    sleep(Duration::from_millis(30)).await;

    c.shutdown(Duration::from_secs(2)).await.unwrap();
    let results = c.drain_results(Duration::from_millis(50)).await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.success));
}
