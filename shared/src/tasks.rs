//! Work units exchanged with processing nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Capture,
    Dissect,
    Analyze,
    Aggregate,
}

/// A unit of work routed to one node by its partition key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub id:            String,
    pub task_type:     TaskType,
    pub priority:      u8,
    #[serde(with = "crate::payload")]
    pub payload:       Vec<u8>,
    pub partition_key: String,
    pub created_at:    DateTime<Utc>,
    #[serde(default)]
    pub deadline:      Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count:   u32,
}

impl ProcessingTask {
    /// New task with a process-unique id and no deadline.
    pub fn new(task_type: TaskType, partition_key: impl Into<String>, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("task-{:x}-{seq}", now.timestamp_millis()),
            task_type,
            priority: 0,
            payload,
            partition_key: partition_key.into(),
            created_at: now,
            deadline: None,
            retry_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d < now)
    }
}

/// Outcome of one task. Failures are values, never aborts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub task_id:      String,
    pub node_id:      String,
    pub success:      bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error:        Option<String>,
    #[serde(with = "crate::payload")]
    pub output:       Vec<u8>,
    /// Wall time spent on the node, in microseconds.
    pub duration_us:  u64,
    pub completed_at: DateTime<Utc>,
}

impl ProcessingResult {
    pub fn success(task_id: &str, node_id: &str, output: Vec<u8>, duration_us: u64) -> Self {
        Self {
            task_id: task_id.to_owned(),
            node_id: node_id.to_owned(),
            success: true,
            error: None,
            output,
            duration_us,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(task_id: &str, node_id: &str, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_owned(),
            node_id: node_id.to_owned(),
            success: false,
            error: Some(error.into()),
            output: Vec::new(),
            duration_us: 0,
            completed_at: Utc::now(),
        }
    }
}
