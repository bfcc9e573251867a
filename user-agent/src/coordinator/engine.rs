// src/coordinator/engine.rs

use futures::future::join_all;
use shared::{ProcessingResult, ProcessingTask};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex, Notify},
    task::JoinHandle,
    time::{interval, sleep, timeout, MissedTickBehavior},
};

use super::{
    balance::{balancer, LoadBalancer},
    client::{ClientError, WorkerClient, WorkerConnector},
    node::{NodeStatus, WorkerNode},
    partition::{partitioner, Partitioner},
    status::{CoordinatorStatus, Counters, NodeStatusSnapshot},
    CoordinatorConfig, CoordinatorError, NodeSpec,
};
use crate::{
    governor::BreakerError,
    shutdown::{self, Shutdown, ShutdownTrigger},
    tap_log,
};

/// A health report above this load marks the node degraded.
const DEGRADED_LOAD: f64 = 0.9;
/// A health report above this error rate marks the node degraded.
const DEGRADED_ERROR_RATE: f64 = 0.1;

struct Registry {
    nodes:       BTreeMap<String, Arc<WorkerNode>>,
    partitioner: Box<dyn Partitioner>,
}

/// Counts spawned dispatches and pending retries so shutdown can wait.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle:  Notify,
}

struct Tracked(Arc<InFlight>);

impl InFlight {
    fn track(self: &Arc<Self>) -> Tracked {
        self.count.fetch_add(1, Ordering::AcqRel);
        Tracked(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

struct Inner {
    cfg:       CoordinatorConfig,
    connector: Arc<dyn WorkerConnector>,
    registry:  RwLock<Registry>,
    balancer:  Box<dyn LoadBalancer>,
    queue:     mpsc::Sender<ProcessingTask>,
    results:   mpsc::Sender<ProcessingResult>,
    counters:  Counters,
    in_flight: Arc<InFlight>,
    shutdown:  Shutdown,
}

pub struct Coordinator {
    inner:   Arc<Inner>,
    results: AsyncMutex<mpsc::Receiver<ProcessingResult>>,
    trigger: ShutdownTrigger,
    loops:   Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build the coordinator and start its batching and health loops.
    /// Must be called inside a Tokio runtime.
    pub fn start(cfg: CoordinatorConfig, connector: Arc<dyn WorkerConnector>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(cfg.queue_size.max(1));
        let (results_tx, results_rx) = mpsc::channel(cfg.result_queue_size.max(1));
        let (trigger, shutdown) = shutdown::channel();

        tap_log!(
            log::Level::Info,
            "coordinator",
            "coordinator started ({} partitioning, {} balancing, batch {} / {:?})",
            cfg.partition_strategy,
            cfg.load_balance_strategy,
            cfg.batch_size,
            cfg.batch_timeout
        );

        let inner = Arc::new(Inner {
            registry: RwLock::new(Registry {
                nodes: BTreeMap::new(),
                partitioner: partitioner(cfg.partition_strategy, cfg.replication_factor),
            }),
            balancer: balancer(cfg.load_balance_strategy),
            cfg,
            connector,
            queue: queue_tx,
            results: results_tx,
            counters: Counters::default(),
            in_flight: Arc::new(InFlight::default()),
            shutdown,
        });

        let loops = vec![
            tokio::spawn(process_loop(Arc::clone(&inner), queue_rx)),
            tokio::spawn(health_loop(Arc::clone(&inner))),
        ];

        Self { inner, results: AsyncMutex::new(results_rx), trigger, loops: Mutex::new(loops) }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.cfg
    }

    /*──────────────────────────── membership ────────────────────────────*/

    pub async fn register_node(
        &self,
        id: impl Into<String>,
        address: impl Into<String>,
        capacity: usize,
    ) -> Result<(), CoordinatorError> {
        self.register(NodeSpec::new(id, capacity).with_address(address)).await
    }

    /// Connect through the connector, then register.
    pub async fn register(&self, spec: NodeSpec) -> Result<(), CoordinatorError> {
        if self.inner.shutdown.is_triggered() {
            return Err(CoordinatorError::ShuttingDown);
        }
        if self.inner.read().nodes.contains_key(&spec.id) {
            return Err(CoordinatorError::DuplicateNode(spec.id));
        }
        let client = self
            .inner
            .connector
            .connect(&spec)
            .await
            .map_err(|source| CoordinatorError::Connect { id: spec.id.clone(), source })?;
        self.register_client(spec, client)
    }

    /// Register a node whose client already exists.
    pub fn register_client(
        &self,
        spec: NodeSpec,
        client: Arc<dyn WorkerClient>,
    ) -> Result<(), CoordinatorError> {
        if self.inner.shutdown.is_triggered() {
            return Err(CoordinatorError::ShuttingDown);
        }
        let mut reg = self.inner.write();
        if reg.nodes.contains_key(&spec.id) {
            return Err(CoordinatorError::DuplicateNode(spec.id));
        }
        reg.partitioner.add_node(&spec.id, spec.weight);
        let node = Arc::new(WorkerNode::new(spec.clone(), client, self.inner.cfg.breaker.clone()));
        reg.nodes.insert(spec.id.clone(), node);
        let count = reg.nodes.len();
        drop(reg);

        metrics::gauge!("coordinator_nodes").set(count as f64);
        tap_log!(
            log::Level::Info,
            "coordinator",
            "registered node {} at {} (capacity {}, weight {})",
            spec.id,
            spec.address,
            spec.capacity,
            spec.weight
        );
        Ok(())
    }

    /// Stop routing to the node, wait for its active tasks to drain, then
    /// remove it and close its client. On drain timeout the node is put back
    /// into rotation and stays registered.
    pub async fn unregister_node(&self, id: &str) -> Result<(), CoordinatorError> {
        let node = self.node(id).ok_or_else(|| CoordinatorError::UnknownNode(id.into()))?;
        node.set_draining(true);
        tap_log!(log::Level::Info, "coordinator", "draining node {} ({} active)", id, node.active());

        let started = Instant::now();
        while node.active() > 0 {
            if started.elapsed() >= self.inner.cfg.drain_timeout {
                node.set_draining(false);
                return Err(CoordinatorError::DrainTimeout {
                    id: id.into(),
                    active: node.active(),
                    waited: started.elapsed(),
                });
            }
            sleep(self.inner.cfg.drain_poll).await;
        }

        {
            let mut reg = self.inner.write();
            reg.nodes.remove(id);
            reg.partitioner.remove_node(id);
            metrics::gauge!("coordinator_nodes").set(reg.nodes.len() as f64);
        }
        if let Err(e) = node.client().close().await {
            tap_log!(log::Level::Warn, "coordinator", "closing node {}: {}", id, e);
        }
        tap_log!(log::Level::Info, "coordinator", "unregistered node {}", id);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<Arc<WorkerNode>> {
        self.inner.read().nodes.get(id).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<WorkerNode>> {
        self.inner.nodes()
    }

    /*──────────────────────────── tasks ────────────────────────────*/

    /// Enqueue without waiting. A full queue is reported, never waited on.
    pub fn submit(&self, task: ProcessingTask) -> Result<(), CoordinatorError> {
        if self.inner.shutdown.is_triggered() {
            return Err(CoordinatorError::ShuttingDown);
        }
        match self.inner.queue.try_send(task) {
            Ok(()) => {
                Counters::bump(&self.inner.counters.submitted, "tasks_submitted_total");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Counters::bump(&self.inner.counters.rejected, "tasks_rejected_total");
                Err(CoordinatorError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CoordinatorError::ShuttingDown),
        }
    }

    /// Submit in order, stopping at the first rejection.
    pub fn submit_batch(&self, tasks: Vec<ProcessingTask>) -> Result<(), CoordinatorError> {
        for (accepted, task) in tasks.into_iter().enumerate() {
            let task_id = task.id.clone();
            self.submit(task).map_err(|source| CoordinatorError::BatchRejected {
                task_id,
                accepted,
                source: Box::new(source),
            })?;
        }
        Ok(())
    }

    /// Next finished result, or `None` after `wait`.
    pub async fn next_result(&self, wait: Duration) -> Option<ProcessingResult> {
        let mut rx = self.results.lock().await;
        timeout(wait, rx.recv()).await.ok().flatten()
    }

    /// Collect results until none arrives for `idle`.
    pub async fn drain_results(&self, idle: Duration) -> Vec<ProcessingResult> {
        let mut out = Vec::new();
        while let Some(r) = self.next_result(idle).await {
            out.push(r);
        }
        out
    }

    /*──────────────────────────── health & status ────────────────────────────*/

    /// One health pass over every node; normally driven by the health loop.
    pub async fn run_health_checks(&self) {
        self.inner.run_health_checks().await;
    }

    pub fn status(&self) -> CoordinatorStatus {
        let nodes: Vec<NodeStatusSnapshot> =
            self.inner.nodes().iter().map(|n| NodeStatusSnapshot::of(n)).collect();
        CoordinatorStatus {
            healthy_nodes: nodes.iter().filter(|n| n.status == NodeStatus::Healthy).count(),
            queue_depth: self.inner.queue.max_capacity() - self.inner.queue.capacity(),
            total_capacity: nodes.iter().map(|n| n.capacity).sum(),
            active_tasks: nodes.iter().map(|n| n.active).sum(),
            metrics: self.inner.counters.snapshot(),
            nodes,
        }
    }

    /// Stop the loops, wait up to `limit` for in-flight dispatches and
    /// retries, then close every node client whatever happened.
    pub async fn shutdown(&self, limit: Duration) -> Result<(), CoordinatorError> {
        tap_log!(log::Level::Info, "coordinator", "shutting down (limit {:?})", limit);
        self.trigger.trigger();

        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(PoisonError::into_inner));
        let inner = &self.inner;
        let clean = timeout(limit, async {
            join_all(loops).await;
            inner.in_flight.wait_idle().await;
        })
        .await
        .is_ok();

        for node in self.inner.nodes() {
            if let Err(e) = node.client().close().await {
                tap_log!(log::Level::Warn, "coordinator", "closing node {}: {}", node.id(), e);
            }
        }

        if clean {
            tap_log!(log::Level::Info, "coordinator", "coordinator stopped");
            Ok(())
        } else {
            tap_log!(log::Level::Warn, "coordinator", "shutdown limit {:?} exceeded", limit);
            Err(CoordinatorError::ShutdownTimeout(limit))
        }
    }
}

/*──────────────────────────── loops ────────────────────────────*/

async fn process_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<ProcessingTask>) {
    let mut shutdown = inner.shutdown.clone();
    let size = inner.cfg.batch_size.max(1);
    let mut batch: Vec<ProcessingTask> = Vec::with_capacity(size);
    let mut ticker = interval(inner.cfg.batch_timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                while let Ok(task) = rx.try_recv() {
                    batch.push(task);
                }
                inner.flush(std::mem::take(&mut batch)).await;
                break;
            }
            next = rx.recv() => match next {
                Some(task) => {
                    batch.push(task);
                    if batch.len() >= size {
                        inner.flush(std::mem::replace(&mut batch, Vec::with_capacity(size))).await;
                        ticker.reset();
                    }
                }
                None => {
                    inner.flush(std::mem::take(&mut batch)).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    inner.flush(std::mem::replace(&mut batch, Vec::with_capacity(size))).await;
                }
            }
        }
    }
    tap_log!(log::Level::Debug, "coordinator", "batch loop stopped");
}

async fn health_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.clone();
    let mut ticker = interval(inner.cfg.health_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => inner.run_health_checks().await,
        }
    }
}

/*──────────────────────────── internals ────────────────────────────*/

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn nodes(&self) -> Vec<Arc<WorkerNode>> {
        self.read().nodes.values().cloned().collect()
    }

    /// Group a batch by node, reserving one slot per placed task. Tasks no
    /// node could take come back in the second list.
    fn partition(
        &self,
        batch: Vec<ProcessingTask>,
    ) -> (Vec<(Arc<WorkerNode>, Vec<ProcessingTask>)>, Vec<ProcessingTask>) {
        let mut groups: Vec<(Arc<WorkerNode>, Vec<ProcessingTask>)> = Vec::new();
        let mut slot: HashMap<String, usize> = HashMap::new();
        let mut homeless = Vec::new();

        let reg = self.read();
        for task in batch {
            let candidates: Vec<Arc<WorkerNode>> =
                reg.nodes.values().filter(|n| n.is_routable()).cloned().collect();
            match self.place(&reg, &task.partition_key, &candidates) {
                Some(node) => {
                    let i = *slot.entry(node.id().to_string()).or_insert_with(|| {
                        groups.push((Arc::clone(&node), Vec::new()));
                        groups.len() - 1
                    });
                    groups[i].1.push(task);
                }
                None => homeless.push(task),
            }
        }
        (groups, homeless)
    }

    fn place(
        &self,
        reg: &Registry,
        key: &str,
        candidates: &[Arc<WorkerNode>],
    ) -> Option<Arc<WorkerNode>> {
        if candidates.is_empty() {
            return None;
        }
        let ids: Vec<&str> = candidates.iter().map(|n| n.id()).collect();
        let preferred = reg
            .partitioner
            .select(key, &ids)
            .and_then(|id| candidates.iter().find(|n| n.id() == id));

        if let Some(node) = self.balancer.choose(preferred, candidates) {
            if node.try_reserve() {
                return Some(node);
            }
        }
        // chosen node filled up meanwhile; take the least loaded that has room
        let mut rest: Vec<&Arc<WorkerNode>> = candidates.iter().collect();
        rest.sort_by(|a, b| a.load().total_cmp(&b.load()));
        rest.into_iter().find(|n| n.try_reserve()).cloned()
    }

    async fn flush(self: &Arc<Self>, batch: Vec<ProcessingTask>) {
        if batch.is_empty() {
            return;
        }
        Counters::bump(&self.counters.batches, "batches_total");
        let (groups, homeless) = self.partition(batch);

        if !homeless.is_empty() {
            tap_log!(log::Level::Debug, "coordinator", "no routable node for {} tasks; requeueing", homeless.len());
        }
        for mut task in homeless {
            if task.is_expired(chrono::Utc::now()) {
                self.emit(ProcessingResult::failure(&task.id, "", "deadline exceeded")).await;
                continue;
            }
            task.retry_count += 1;
            Counters::bump(&self.counters.requeued, "tasks_requeued_total");
            self.schedule(task, self.cfg.requeue_delay);
        }

        for (node, tasks) in groups {
            let inner = Arc::clone(self);
            let guard = self.in_flight.track();
            tokio::spawn(async move {
                let _guard = guard;
                inner.dispatch(node, tasks).await;
            });
        }
    }

    async fn dispatch(self: Arc<Self>, node: Arc<WorkerNode>, tasks: Vec<ProcessingTask>) {
        let n = tasks.len();
        let limit = self.cfg.dispatch_timeout;
        let started = Instant::now();

        let outcome = node
            .breaker()
            .call(|| async {
                match timeout(limit, node.client().process_batch(&tasks)).await {
                    Ok(res) => res,
                    Err(_) => Err(ClientError::Timeout(limit)),
                }
            })
            .await;
        node.release(n);
        let elapsed = started.elapsed();
        metrics::histogram!("dispatch_latency_seconds").record(elapsed.as_secs_f64());

        match outcome {
            Ok(results) => {
                node.record_success(results.len(), elapsed);
                let mut by_task: HashMap<String, ProcessingResult> =
                    results.into_iter().map(|r| (r.task_id.clone(), r)).collect();
                for task in tasks {
                    match by_task.remove(&task.id) {
                        Some(mut r) => {
                            r.node_id = node.id().to_string();
                            self.emit(r).await;
                        }
                        None => self.retry(task, node.id(), "node returned no result").await,
                    }
                }
            }
            Err(BreakerError::Open(name)) => {
                tap_log!(log::Level::Debug, "coordinator", "breaker {} open; rerouting {} tasks", name, n);
                for task in tasks {
                    self.retry(task, node.id(), &format!("circuit breaker '{name}' is open")).await;
                }
            }
            Err(BreakerError::Inner(e)) => {
                Counters::bump(&self.counters.dispatch_errors, "dispatch_errors_total");
                let status = node.record_failure(self.cfg.unhealthy_error_threshold);
                tap_log!(
                    log::Level::Warn,
                    "coordinator",
                    "dispatch of {} tasks to node {} failed: {} (node {})",
                    n,
                    node.id(),
                    e,
                    status
                );
                let reason = e.to_string();
                for task in tasks {
                    self.retry(task, node.id(), &reason).await;
                }
            }
        }
    }

    /// Retry after `retry_backoff × retry_count`, or give up with a terminal
    /// failure once `max_retries` is spent.
    async fn retry(self: &Arc<Self>, mut task: ProcessingTask, node_id: &str, error: &str) {
        task.retry_count += 1;
        if task.retry_count > self.cfg.max_retries {
            let msg = format!("max retries exceeded: {error}");
            self.emit(ProcessingResult::failure(&task.id, node_id, msg)).await;
            return;
        }
        Counters::bump(&self.counters.retried, "tasks_retried_total");
        let delay = self.cfg.retry_backoff * task.retry_count;
        self.schedule(task, delay);
    }

    /// Put `task` back on the queue after `delay`. A shutdown in between
    /// turns it into a terminal failure.
    fn schedule(self: &Arc<Self>, task: ProcessingTask, delay: Duration) {
        let inner = Arc::clone(self);
        let guard = self.in_flight.track();
        tokio::spawn(async move {
            let _guard = guard;
            let mut shutdown = inner.shutdown.clone();
            tokio::select! {
                _ = shutdown.wait() => {
                    inner.emit(ProcessingResult::failure(&task.id, "", "coordinator shut down before retry")).await;
                    return;
                }
                _ = sleep(delay) => {}
            }
            if let Err(mpsc::error::SendError(task)) = inner.queue.send(task).await {
                inner.emit(ProcessingResult::failure(&task.id, "", "coordinator shut down before retry")).await;
            }
        });
    }

    /// Hand a result to the consumer. During shutdown a full result queue
    /// drops the result instead of blocking.
    async fn emit(&self, result: ProcessingResult) {
        if result.success {
            Counters::bump(&self.counters.completed, "tasks_completed_total");
        } else {
            Counters::bump(&self.counters.failed, "tasks_failed_total");
        }
        let mut shutdown = self.shutdown.clone();
        let permit = tokio::select! {
            p = self.results.reserve() => p.ok(),
            _ = shutdown.wait() => self.results.try_reserve().ok(),
        };
        match permit {
            Some(p) => p.send(result),
            None => tap_log!(log::Level::Warn, "coordinator", "result for task {} dropped", result.task_id),
        }
    }

    async fn run_health_checks(&self) {
        let nodes = self.nodes();
        let limit = self.cfg.health_check_timeout;
        let checks = nodes.iter().map(|n| async move {
            let outcome = match timeout(limit, n.client().health_check()).await {
                Ok(res) => res,
                Err(_) => Err(ClientError::Timeout(limit)),
            };
            (n, outcome)
        });

        for (node, outcome) in join_all(checks).await {
            match outcome {
                Ok(report) => {
                    node.touch();
                    node.reset_recent_errors();
                    let to = if report.load > DEGRADED_LOAD || report.error_rate > DEGRADED_ERROR_RATE {
                        NodeStatus::Degraded
                    } else {
                        NodeStatus::Healthy
                    };
                    node.set_status(to);
                }
                Err(e) => {
                    metrics::counter!("health_check_failures_total", "node" => node.id().to_string())
                        .increment(1);
                    tap_log!(log::Level::Debug, "coordinator", "health check of {} failed: {}", node.id(), e);
                    if node.silent_for() > self.cfg.node_timeout {
                        node.set_status(NodeStatus::Offline);
                    } else if node.status() == NodeStatus::Healthy {
                        node.set_status(NodeStatus::Degraded);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::client::HealthReport;
    use async_trait::async_trait;
    use shared::TaskType;

    struct Echo;

    #[async_trait]
    impl WorkerClient for Echo {
        async fn process_batch(&self, tasks: &[ProcessingTask]) -> Result<Vec<ProcessingResult>, ClientError> {
            Ok(tasks.iter().map(|t| ProcessingResult::success(&t.id, "", t.payload.clone(), 1)).collect())
        }
        async fn health_check(&self) -> Result<HealthReport, ClientError> {
            Ok(HealthReport { load: 0.1, error_rate: 0.0, active: 0, capacity: 10 })
        }
        async fn close(&self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct Refuse;

    #[async_trait]
    impl WorkerConnector for Refuse {
        async fn connect(&self, node: &NodeSpec) -> Result<Arc<dyn WorkerClient>, ClientError> {
            Err(ClientError::Unavailable(node.address.clone()))
        }
    }

    fn cfg() -> CoordinatorConfig {
        CoordinatorConfig {
            queue_size: 4,
            batch_timeout: Duration::from_millis(10),
            ..CoordinatorConfig::default()
        }
    }

    fn task(key: &str) -> ProcessingTask {
        ProcessingTask::new(TaskType::Analyze, key, key.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn results_carry_the_serving_node() {
        let c = Coordinator::start(cfg(), Arc::new(Refuse));
        c.register_client(NodeSpec::new("n1", 10), Arc::new(Echo)).unwrap();
        c.submit(task("pid:1")).unwrap();

        let r = c.next_result(Duration::from_secs(2)).await.unwrap();
        assert!(r.success);
        assert_eq!(r.node_id, "n1");
        assert_eq!(r.output, b"pid:1");
        c.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn membership_errors() {
        let c = Coordinator::start(cfg(), Arc::new(Refuse));
        c.register_client(NodeSpec::new("n1", 1), Arc::new(Echo)).unwrap();
        assert!(matches!(
            c.register_client(NodeSpec::new("n1", 1), Arc::new(Echo)),
            Err(CoordinatorError::DuplicateNode(_))
        ));
        assert!(matches!(
            c.register_node("n2", "10.0.0.2:7000", 5).await,
            Err(CoordinatorError::Connect { .. })
        ));
        assert!(matches!(c.unregister_node("ghost").await, Err(CoordinatorError::UnknownNode(_))));
        c.unregister_node("n1").await.unwrap();
        assert!(c.nodes().is_empty());
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let c = Coordinator::start(
            CoordinatorConfig { queue_size: 2, batch_timeout: Duration::from_secs(60), batch_size: 100, ..cfg() },
            Arc::new(Refuse),
        );
        // nothing yields here, so the batch loop has not drained the queue yet
        let outcomes: Vec<_> = (0..5).map(|i| c.submit(task(&format!("k{i}")))).collect();
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 2);
        assert!(matches!(outcomes[4], Err(CoordinatorError::QueueFull)));
        assert_eq!(c.status().metrics.rejected, 3);
        assert_eq!(c.status().queue_depth, 2);

        let err = c.submit_batch(vec![task("a"), task("b"), task("c")]).unwrap_err();
        assert!(matches!(err, CoordinatorError::BatchRejected { accepted: 0, .. }));
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let c = Coordinator::start(cfg(), Arc::new(Refuse));
        c.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(c.submit(task("x")), Err(CoordinatorError::ShuttingDown)));
    }
}
