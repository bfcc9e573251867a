// src/coordinator/client.rs

//! Boundary to a worker node. The wire transport lives elsewhere; here is the
//! contract plus the in-process worker that runs the filter pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{ProcessingResult, ProcessingTask};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;

use super::NodeSpec;
use crate::filters::{Input, Pipeline};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Active tasks over capacity.
    pub load:       f64,
    pub error_rate: f64,
    pub active:     usize,
    pub capacity:   usize,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("node unreachable: {0}")]
    Unavailable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("client is closed")]
    Closed,

    #[error("node rejected the batch: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait WorkerClient: Send + Sync + 'static {
    /// One call per node-partition. Results come back in task order.
    async fn process_batch(&self, tasks: &[ProcessingTask]) -> Result<Vec<ProcessingResult>, ClientError>;

    async fn health_check(&self) -> Result<HealthReport, ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

/// Opens a client for a node at registration time.
#[async_trait]
pub trait WorkerConnector: Send + Sync + 'static {
    async fn connect(&self, node: &NodeSpec) -> Result<Arc<dyn WorkerClient>, ClientError>;
}

/*──────────────────────────────── in-process ────────────────────────────────*/

/// Runs each task's payload through a filter pipeline. The result output is
/// the JSON-encoded stage result.
pub struct LocalWorker {
    node_id:   String,
    pipeline:  Arc<Pipeline>,
    capacity:  usize,
    active:    AtomicUsize,
    processed: AtomicU64,
    failed:    AtomicU64,
    closed:    AtomicBool,
}

impl LocalWorker {
    pub fn new(node_id: impl Into<String>, pipeline: Arc<Pipeline>, capacity: usize) -> Self {
        Self {
            node_id: node_id.into(),
            pipeline,
            capacity: capacity.max(1),
            active: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

fn analyse(pipeline: &Pipeline, node_id: &str, task: &ProcessingTask) -> ProcessingResult {
    let started = Instant::now();
    if task.is_expired(chrono::Utc::now()) {
        return ProcessingResult::failure(&task.id, node_id, "deadline exceeded");
    }
    let input = Input::raw(task.partition_key.clone(), task.payload.clone());
    let stage = pipeline.process(&input);
    match serde_json::to_vec(&stage) {
        Ok(output) => {
            let us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            ProcessingResult::success(&task.id, node_id, output, us)
        }
        Err(e) => ProcessingResult::failure(&task.id, node_id, format!("encode stage result: {e}")),
    }
}

#[async_trait]
impl WorkerClient for LocalWorker {
    async fn process_batch(&self, tasks: &[ProcessingTask]) -> Result<Vec<ProcessingResult>, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.active.fetch_add(tasks.len(), Ordering::AcqRel);

        // regex and entropy scans are CPU-bound
        let pipeline = Arc::clone(&self.pipeline);
        let node_id = self.node_id.clone();
        let batch = tasks.to_vec();
        let joined = tokio::task::spawn_blocking(move || {
            batch.iter().map(|t| analyse(&pipeline, &node_id, t)).collect::<Vec<_>>()
        })
        .await;
        self.active.fetch_sub(tasks.len(), Ordering::AcqRel);

        let results = joined.map_err(|e| ClientError::Rejected(format!("analysis task failed: {e}")))?;
        let failed = results.iter().filter(|r| !r.success).count() as u64;
        self.failed.fetch_add(failed, Ordering::Relaxed);
        self.processed.fetch_add(results.len() as u64 - failed, Ordering::Relaxed);
        Ok(results)
    }

    async fn health_check(&self) -> Result<HealthReport, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let active = self.active.load(Ordering::Acquire);
        let processed = self.processed.load(Ordering::Relaxed) as f64;
        let failed = self.failed.load(Ordering::Relaxed) as f64;
        Ok(HealthReport {
            load: active as f64 / self.capacity as f64,
            error_rate: if processed + failed == 0.0 { 0.0 } else { failed / (processed + failed) },
            active,
            capacity: self.capacity,
        })
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Connects every node to an in-process worker sharing one analysis pipeline.
pub struct LocalConnector {
    pipeline: Arc<Pipeline>,
}

impl LocalConnector {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl WorkerConnector for LocalConnector {
    async fn connect(&self, node: &NodeSpec) -> Result<Arc<dyn WorkerClient>, ClientError> {
        Ok(Arc::new(LocalWorker::new(node.id.clone(), Arc::clone(&self.pipeline), node.capacity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{FilterConfig, PatternRegistry, StageResult};
    use shared::TaskType;

    fn worker() -> LocalWorker {
        let p = Pipeline::analysis(&FilterConfig::default(), &PatternRegistry::builtin().unwrap()).unwrap();
        LocalWorker::new("local-1", Arc::new(p), 4)
    }

    #[tokio::test]
    async fn batch_results_follow_task_order() {
        let w = worker();
        let tasks = vec![
            ProcessingTask::new(TaskType::Analyze, "pid:1", b"hello".to_vec()),
            ProcessingTask::new(TaskType::Analyze, "pid:1", b"cat ../../../etc/passwd".to_vec()),
        ];
        let results = w.process_batch(&tasks).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].task_id, tasks[0].id);
        assert!(results.iter().all(|r| r.success && r.node_id == "local-1"));

        let clean: StageResult = serde_json::from_slice(&results[0].output).unwrap();
        assert!(clean.findings.is_empty());
        let hit: StageResult = serde_json::from_slice(&results[1].output).unwrap();
        assert!(!hit.findings.is_empty());

        let health = w.health_check().await.unwrap();
        assert_eq!(health.active, 0);
        assert_eq!(health.capacity, 4);
    }

    #[tokio::test]
    async fn analysis_does_not_charge_the_rate_limit() {
        let cfg = FilterConfig { rate_limit_rps: 0.0, rate_limit_burst: 1, ..FilterConfig::default() };
        let p = Pipeline::analysis(&cfg, &PatternRegistry::builtin().unwrap()).unwrap();
        let w = LocalWorker::new("local-1", Arc::new(p), 4);
        let tasks: Vec<_> =
            (0..5).map(|_| ProcessingTask::new(TaskType::Analyze, "pid:1", b"hello".to_vec())).collect();
        for r in w.process_batch(&tasks).await.unwrap() {
            let stage: StageResult = serde_json::from_slice(&r.output).unwrap();
            assert!(stage.findings.is_empty(), "{:?}", stage.findings);
            assert!(stage.skipped.is_empty());
        }
        assert_eq!(w.health_check().await.unwrap().error_rate, 0.0);
    }

    #[tokio::test]
    async fn expired_tasks_fail() {
        let w = worker();
        let task = ProcessingTask::new(TaskType::Analyze, "k", b"x".to_vec())
            .with_deadline(chrono::Utc::now() - chrono::Duration::seconds(1));
        let results = w.process_batch(&[task]).await.unwrap();
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("deadline exceeded"));
    }

    #[tokio::test]
    async fn closed_worker_refuses_work() {
        let w = worker();
        w.close().await.unwrap();
        assert!(matches!(w.process_batch(&[]).await, Err(ClientError::Closed)));
        assert!(matches!(w.health_check().await, Err(ClientError::Closed)));
    }
}
