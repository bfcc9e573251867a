// src/coordinator/balance.rs

//! Second opinion on the partitioner's choice, based on live load.

use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use super::{node::WorkerNode, partition::UnknownStrategy};

/// The partitioner's pick is kept while its load stays under this.
const PREFERRED_LOAD_CEILING: f64 = 0.8;
const RECENT_WINDOW: Duration = Duration::from_secs(30);
const RECENT_BOOST: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceStrategy {
    LeastLoaded,
    WeightedResponseTime,
    RoundRobin,
}

impl FromStr for BalanceStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "least-loaded" => Ok(Self::LeastLoaded),
            "weighted-response-time" | "response-time" => Ok(Self::WeightedResponseTime),
            "round-robin" => Ok(Self::RoundRobin),
            _ => Err(UnknownStrategy { kind: "load-balance", value: s.into() }),
        }
    }
}

impl fmt::Display for BalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LeastLoaded => "least-loaded",
            Self::WeightedResponseTime => "weighted-response-time",
            Self::RoundRobin => "round-robin",
        })
    }
}

pub trait LoadBalancer: Send + Sync {
    /// Final node for a task, given the partitioner's `preferred` pick.
    fn choose(
        &self,
        preferred: Option<&Arc<WorkerNode>>,
        candidates: &[Arc<WorkerNode>],
    ) -> Option<Arc<WorkerNode>>;
}

pub fn balancer(strategy: BalanceStrategy) -> Box<dyn LoadBalancer> {
    match strategy {
        BalanceStrategy::LeastLoaded => Box::new(LeastLoaded),
        BalanceStrategy::WeightedResponseTime => Box::new(WeightedResponseTime),
        BalanceStrategy::RoundRobin => Box::new(RoundRobin::default()),
    }
}

pub struct LeastLoaded;

impl LoadBalancer for LeastLoaded {
    fn choose(
        &self,
        preferred: Option<&Arc<WorkerNode>>,
        candidates: &[Arc<WorkerNode>],
    ) -> Option<Arc<WorkerNode>> {
        if let Some(p) = preferred {
            if p.load() < PREFERRED_LOAD_CEILING {
                return Some(Arc::clone(p));
            }
        }
        candidates
            .iter()
            .min_by(|a, b| a.load().total_cmp(&b.load()))
            .cloned()
            .or_else(|| preferred.cloned())
    }
}

pub struct WeightedResponseTime;

impl WeightedResponseTime {
    /// Higher is better. Nodes without samples score 1.0 so they get tried.
    pub fn score(node: &WorkerNode) -> f64 {
        let times = node.response_times();
        let Some(avg) = times.average() else {
            return 1.0;
        };
        let avg_ms = (avg.as_secs_f64() * 1_000.0).max(f64::EPSILON);
        let mut score = 1.0 / (avg_ms * (1.0 + node.failure_rate()) * (1.0 + node.load()));
        if times.last_updated().is_some_and(|t| t.elapsed() < RECENT_WINDOW) {
            score *= RECENT_BOOST;
        }
        score
    }
}

impl LoadBalancer for WeightedResponseTime {
    fn choose(
        &self,
        preferred: Option<&Arc<WorkerNode>>,
        candidates: &[Arc<WorkerNode>],
    ) -> Option<Arc<WorkerNode>> {
        candidates
            .iter()
            .map(|n| (Self::score(n), n))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, n)| Arc::clone(n))
            .or_else(|| preferred.cloned())
    }
}

#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn choose(
        &self,
        preferred: Option<&Arc<WorkerNode>>,
        candidates: &[Arc<WorkerNode>],
    ) -> Option<Arc<WorkerNode>> {
        if candidates.is_empty() {
            return preferred.cloned();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[i]))
    }
}
