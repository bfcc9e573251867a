// src/coordinator/node.rs

//! A registered worker node and its bookkeeping.
//!
//! Counters are atomics so the dispatch path never takes a lock; only the
//! response-time ring and the last-seen stamp sit behind small mutexes.

use serde::Serialize;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use super::{client::WorkerClient, NodeSpec};
use crate::{
    governor::{BreakerConfig, BreakerState, CircuitBreaker},
    tap_log,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl NodeStatus {
    /// Healthy and degraded nodes still take work.
    pub fn accepts_work(self) -> bool {
        matches!(self, NodeStatus::Healthy | NodeStatus::Degraded)
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeStatus::Healthy,
            1 => NodeStatus::Degraded,
            2 => NodeStatus::Unhealthy,
            _ => NodeStatus::Offline,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeStatus::Healthy => "healthy",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Unhealthy => "unhealthy",
            NodeStatus::Offline => "offline",
        })
    }
}

const TRACKER_SAMPLES: usize = 100;

/// Ring of the last 100 batch latencies.
#[derive(Debug, Default, Clone)]
pub struct ResponseTimeTracker {
    samples:      VecDeque<Duration>,
    last_updated: Option<Instant>,
}

impl ResponseTimeTracker {
    pub fn record(&mut self, d: Duration) {
        if self.samples.len() == TRACKER_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(d);
        self.last_updated = Some(Instant::now());
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Nearest-rank percentile, `p` in `0..=100`.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    pub fn last_updated(&self) -> Option<Instant> {
        self.last_updated
    }
}

pub struct WorkerNode {
    spec:          NodeSpec,
    client:        Arc<dyn WorkerClient>,
    breaker:       CircuitBreaker,
    status:        AtomicU8,
    draining:      AtomicBool,
    active:        AtomicUsize,
    processed:     AtomicU64,
    errors:        AtomicU64,
    recent_errors: AtomicU64,
    last_seen:     Mutex<Instant>,
    response:      Mutex<ResponseTimeTracker>,
}

impl WorkerNode {
    pub fn new(spec: NodeSpec, client: Arc<dyn WorkerClient>, breaker: BreakerConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(format!("node:{}", spec.id), breaker),
            spec,
            client,
            status: AtomicU8::new(NodeStatus::Healthy.to_u8()),
            draining: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            recent_errors: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
            response: Mutex::new(ResponseTimeTracker::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn capacity(&self) -> usize {
        self.spec.capacity
    }

    pub fn client(&self) -> &Arc<dyn WorkerClient> {
        &self.client
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Returns the previous status.
    pub fn set_status(&self, to: NodeStatus) -> NodeStatus {
        let from = NodeStatus::from_u8(self.status.swap(to.to_u8(), Ordering::AcqRel));
        if from != to {
            let level = if to.accepts_work() { log::Level::Info } else { log::Level::Warn };
            tap_log!(level, "coordinator", "node {} {} -> {}", self.spec.id, from, to);
            metrics::counter!("node_status_changes_total", "node" => self.spec.id.clone(), "to" => to.to_string())
                .increment(1);
        }
        from
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }

    /// Can take one more task right now.
    pub fn is_routable(&self) -> bool {
        self.status().accepts_work()
            && !self.is_draining()
            && self.active() < self.capacity()
            && self.breaker.state() != BreakerState::Open
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Claim one slot; fails once `active` has reached capacity.
    pub fn try_reserve(&self) -> bool {
        let cap = self.capacity();
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |a| (a < cap).then_some(a + 1))
            .is_ok()
    }

    pub fn release(&self, n: usize) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |a| Some(a.saturating_sub(n)));
    }

    pub fn load(&self) -> f64 {
        self.active() as f64 / self.capacity().max(1) as f64
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Failed dispatches over all dispatches.
    pub fn failure_rate(&self) -> f64 {
        let errors = self.errors() as f64;
        let total = self.processed() as f64 + errors;
        if total == 0.0 { 0.0 } else { errors / total }
    }

    pub fn record_success(&self, tasks: usize, elapsed: Duration) {
        self.processed.fetch_add(tasks as u64, Ordering::Relaxed);
        self.response.lock().unwrap_or_else(PoisonError::into_inner).record(elapsed);
        self.touch();
    }

    /// Count a failed dispatch and downgrade. Returns the new status.
    pub fn record_failure(&self, unhealthy_threshold: u64) -> NodeStatus {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let recent = self.recent_errors.fetch_add(1, Ordering::AcqRel) + 1;
        let to = if recent > unhealthy_threshold { NodeStatus::Unhealthy } else { NodeStatus::Degraded };
        if self.status() != NodeStatus::Offline {
            self.set_status(to);
        }
        self.status()
    }

    pub fn reset_recent_errors(&self) {
        self.recent_errors.store(0, Ordering::Release);
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn silent_for(&self) -> Duration {
        self.last_seen.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }

    pub fn response_times(&self) -> ResponseTimeTracker {
        self.response.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl fmt::Debug for WorkerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerNode")
            .field("id", &self.spec.id)
            .field("status", &self.status())
            .field("active", &self.active())
            .field("capacity", &self.spec.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::client::{ClientError, HealthReport};
    use async_trait::async_trait;
    use shared::{ProcessingResult, ProcessingTask};

    struct Idle;

    #[async_trait]
    impl WorkerClient for Idle {
        async fn process_batch(&self, _: &[ProcessingTask]) -> Result<Vec<ProcessingResult>, ClientError> {
            Ok(Vec::new())
        }
        async fn health_check(&self) -> Result<HealthReport, ClientError> {
            Err(ClientError::Closed)
        }
        async fn close(&self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn node(capacity: usize) -> WorkerNode {
        WorkerNode::new(NodeSpec::new("n", capacity), Arc::new(Idle), BreakerConfig::default())
    }

    #[test]
    fn reservations_stop_at_capacity() {
        let n = node(2);
        assert!(n.try_reserve());
        assert!(n.try_reserve());
        assert!(!n.try_reserve());
        assert!(!n.is_routable());
        n.release(1);
        assert!(n.is_routable());
        n.release(5);
        assert_eq!(n.active(), 0);
    }

    #[test]
    fn failures_degrade_then_mark_unhealthy() {
        let n = node(4);
        assert_eq!(n.record_failure(2), NodeStatus::Degraded);
        assert_eq!(n.record_failure(2), NodeStatus::Degraded);
        assert_eq!(n.record_failure(2), NodeStatus::Unhealthy);
        assert!(!n.is_routable());
        n.reset_recent_errors();
        assert_eq!(n.record_failure(2), NodeStatus::Degraded);
        assert_eq!(n.errors(), 4);
    }

    #[test]
    fn draining_nodes_take_no_work() {
        let n = node(4);
        n.set_draining(true);
        assert!(!n.is_routable());
    }

    #[test]
    fn tracker_keeps_last_hundred() {
        let mut t = ResponseTimeTracker::default();
        assert!(t.average().is_none());
        for ms in 1..=150u64 {
            t.record(Duration::from_millis(ms));
        }
        assert_eq!(t.len(), 100);
        // samples 51..=150
        assert_eq!(t.average(), Some(Duration::from_micros(100_500)));
        assert_eq!(t.percentile(50.0), Some(Duration::from_millis(100)));
        assert_eq!(t.percentile(100.0), Some(Duration::from_millis(150)));
        assert!(t.last_updated().is_some());
    }
}
