//! Process discovery and STDIO capture.
//! -----------------------------------------------------------------------------
//! A **capturer** attaches to one process and yields its reads and writes as
//! `StreamEvent`s. Backends are interchangeable:
//!   • `StraceCapturer`    → ptrace via an `strace` child (needs privileges).
//!   • `ChannelCapturer`   → events pushed through a crossbeam channel.
//!   • `SimulatedCapturer` → synthetic JSON-RPC traffic for demos.
//!
//! The `StdioMonitor` glues a capturer to the edge pipeline and the sink.

pub mod channel;
pub mod monitor;
pub mod process;
pub mod simulate;
pub mod strace;

use async_trait::async_trait;
use log::Level;
use shared::StreamEvent;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::tap_log;

pub use channel::ChannelCapturer;
pub use monitor::{stdio_risk_finding, MonitorReport, StdioMonitor};
pub use process::{
    default_patterns, discover_processes, DiscoveryError, ProcFs, Process, ProcessKind,
    ProcessMatcher, ProcessSource, StaticProcessSource,
};
pub use simulate::SimulatedCapturer;
pub use strace::StraceCapturer;

/// Queue between a backend reader and its session.
pub(crate) const SESSION_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub patterns:          Vec<String>,
    /// Explicit targets; empty means auto-discover.
    pub pids:              Vec<u32>,
    pub strace_path:       String,
    pub string_limit:      usize,
    /// How long strace gets to fail an attach before we call it attached.
    pub attach_grace:      Duration,
    pub stdio_only:        bool,
    pub simulate:          bool,
    pub simulate_interval: Duration,
    pub rescan_interval:   Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            patterns: default_patterns(),
            pids: Vec::new(),
            strace_path: "strace".into(),
            string_limit: 65_535,
            attach_grace: Duration::from_millis(200),
            stdio_only: true,
            simulate: false,
            simulate_interval: Duration::from_millis(500),
            rescan_interval: Duration::from_secs(5),
        }
    }
}

/// Why a capturer could not attach. Logged; the target is skipped.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("permission denied attaching to pid {pid}: {detail}")]
    PermissionDenied { pid: u32, detail: String },

    #[error("process {0} vanished before attach")]
    ProcessVanished(u32),

    #[error("cannot start capture backend '{program}': {source}")]
    Spawn { program: String, #[source] source: std::io::Error },

    #[error("capture backend failed for pid {pid}: {detail}")]
    Backend { pid: u32, detail: String },
}

#[async_trait]
pub trait Capturer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn attach(&self, target: &Process) -> Result<CaptureSession, CaptureError>;
}

/// Live attachment to one process. Dropping it detaches as well, just
/// without waiting for the backend to wind down.
pub struct CaptureSession {
    pid:    u32,
    events: ReceiverStream<StreamEvent>,
    stop:   Option<oneshot::Sender<()>>,
    task:   Option<JoinHandle<()>>,
}

impl CaptureSession {
    /// Session whose backend task feeds `events` until `stop` fires.
    pub fn new(
        pid: u32,
        events: mpsc::Receiver<StreamEvent>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self { pid, events: ReceiverStream::new(events), stop: Some(stop), task: Some(task) }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next event, `None` once the target or the backend is gone.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.next().await
    }

    pub async fn detach(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tap_log!(Level::Warn, "capture", "capture backend for pid {} ended abnormally: {}", self.pid, e);
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
