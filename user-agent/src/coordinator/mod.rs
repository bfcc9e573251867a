//! Distributed analysis coordinator.
//! -----------------------------------------------------------------------------
//! Tasks are queued, cut into batches, partitioned by key onto worker nodes,
//! balanced by load and dispatched one batch call per node. Failures feed
//! back into node health, per-node circuit breakers and bounded retries.
//!
//!   submit ─► queue ─► batch ─► partition ─► balance ─► dispatch ─► results
//!                 ▲                                       │
//!                 └──────────── requeue / retry ◄─────────┘

pub mod balance;
pub mod client;
pub mod engine;
pub mod node;
pub mod partition;
pub mod status;

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::governor::BreakerConfig;

pub use balance::{BalanceStrategy, LoadBalancer};
pub use client::{ClientError, HealthReport, LocalConnector, LocalWorker, WorkerClient, WorkerConnector};
pub use engine::Coordinator;
pub use node::{NodeStatus, ResponseTimeTracker, WorkerNode};
pub use partition::{ConsistentHashRing, PartitionStrategy, Partitioner, UnknownStrategy};
pub use status::{CoordinatorStatus, MetricsSnapshot, NodeStatusSnapshot};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub queue_size:                usize,
    pub result_queue_size:         usize,
    pub batch_size:                usize,
    pub batch_timeout:             Duration,
    pub max_retries:               u32,
    /// Retry delay is this times the task's retry count.
    pub retry_backoff:             Duration,
    /// Wait before re-queueing a task no node could take.
    pub requeue_delay:             Duration,
    pub partition_strategy:        PartitionStrategy,
    pub replication_factor:        usize,
    pub load_balance_strategy:     BalanceStrategy,
    pub health_check_interval:     Duration,
    pub health_check_timeout:      Duration,
    pub node_timeout:              Duration,
    /// Dispatch failures since the last good health check before a node
    /// is marked unhealthy.
    pub unhealthy_error_threshold: u64,
    pub drain_timeout:             Duration,
    pub drain_poll:                Duration,
    pub dispatch_timeout:          Duration,
    pub breaker:                   BreakerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            result_queue_size: 10_000,
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            requeue_delay: Duration::from_millis(100),
            partition_strategy: PartitionStrategy::ConsistentHash,
            replication_factor: 100,
            load_balance_strategy: BalanceStrategy::LeastLoaded,
            health_check_interval: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(2),
            node_timeout: Duration::from_secs(30),
            unhealthy_error_threshold: 10,
            drain_timeout: Duration::from_secs(30),
            drain_poll: Duration::from_millis(100),
            dispatch_timeout: Duration::from_secs(30),
            breaker: BreakerConfig::default(),
        }
    }
}

fn default_address() -> String { "local".into() }
fn default_capacity() -> usize { 10 }
fn default_weight() -> u32 { 1 }

/// One `[[nodes]]` entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default = "default_address")]  pub address:  String,
    #[serde(default = "default_capacity")] pub capacity: usize,
    #[serde(default = "default_weight")]   pub weight:   u32,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self { id: id.into(), address: default_address(), capacity, weight: default_weight() }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("task queue full")]
    QueueFull,

    #[error("coordinator shutting down")]
    ShuttingDown,

    #[error("node '{0}' is already registered")]
    DuplicateNode(String),

    #[error("node '{0}' is not registered")]
    UnknownNode(String),

    #[error("node '{id}' still had {active} active tasks after {waited:?}")]
    DrainTimeout { id: String, active: usize, waited: Duration },

    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("cannot connect to node '{id}': {source}")]
    Connect { id: String, #[source] source: ClientError },

    #[error("task {task_id} rejected after {accepted} accepted: {source}")]
    BatchRejected { task_id: String, accepted: usize, #[source] source: Box<CoordinatorError> },
}
