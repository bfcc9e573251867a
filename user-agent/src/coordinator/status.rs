// src/coordinator/status.rs

//! Point-in-time views of the coordinator, built from in-process counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::node::{NodeStatus, WorkerNode};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatusSnapshot {
    pub id:              String,
    pub address:         String,
    pub status:          NodeStatus,
    pub draining:        bool,
    pub active:          usize,
    pub capacity:        usize,
    pub load:            f64,
    pub processed:       u64,
    pub errors:          u64,
    pub avg_response_ms: Option<f64>,
    pub p95_response_ms: Option<f64>,
    pub breaker:         String,
}

impl NodeStatusSnapshot {
    pub(crate) fn of(node: &WorkerNode) -> Self {
        let times = node.response_times();
        let ms = |d: std::time::Duration| d.as_secs_f64() * 1_000.0;
        Self {
            id: node.id().to_string(),
            address: node.spec().address.clone(),
            status: node.status(),
            draining: node.is_draining(),
            active: node.active(),
            capacity: node.capacity(),
            load: node.load(),
            processed: node.processed(),
            errors: node.errors(),
            avg_response_ms: times.average().map(ms),
            p95_response_ms: times.percentile(95.0).map(ms),
            breaker: node.breaker().state().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted:       u64,
    pub rejected:       u64,
    pub completed:      u64,
    pub failed:         u64,
    pub retried:        u64,
    pub requeued:       u64,
    pub batches:        u64,
    pub dispatch_errors: u64,
    /// Successful over all finished tasks; 1.0 before anything finished.
    pub success_rate:   f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub nodes:          Vec<NodeStatusSnapshot>,
    pub healthy_nodes:  usize,
    pub queue_depth:    usize,
    pub total_capacity: usize,
    pub active_tasks:   usize,
    pub metrics:        MetricsSnapshot,
}

/// Lock-free counters mirrored to the `metrics` facade.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted:       AtomicU64,
    pub rejected:        AtomicU64,
    pub completed:       AtomicU64,
    pub failed:          AtomicU64,
    pub retried:         AtomicU64,
    pub requeued:        AtomicU64,
    pub batches:         AtomicU64,
    pub dispatch_errors: AtomicU64,
}

impl Counters {
    pub fn bump(c: &AtomicU64, name: &'static str) {
        c.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(name).increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let completed = get(&self.completed);
        let failed = get(&self.failed);
        let finished = completed + failed;
        MetricsSnapshot {
            submitted: get(&self.submitted),
            rejected: get(&self.rejected),
            completed,
            failed,
            retried: get(&self.retried),
            requeued: get(&self.requeued),
            batches: get(&self.batches),
            dispatch_errors: get(&self.dispatch_errors),
            success_rate: if finished == 0 { 1.0 } else { completed as f64 / finished as f64 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_counts_finished_tasks() {
        let c = Counters::default();
        assert_eq!(c.snapshot().success_rate, 1.0);
        for _ in 0..3 {
            Counters::bump(&c.completed, "tasks_completed_total");
        }
        Counters::bump(&c.failed, "tasks_failed_total");
        let s = c.snapshot();
        assert_eq!(s.completed, 3);
        assert_eq!(s.success_rate, 0.75);
    }
}
