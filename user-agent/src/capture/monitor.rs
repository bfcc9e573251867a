// src/capture/monitor.rs

//! Per-process monitoring: capture → edge pipeline → sink, and optionally
//! on to the coordinator for deeper analysis.

use futures::future::join_all;
use shared::{Category, Finding, ProcessingTask, Severity, StreamEvent, TaskType};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use super::{
    discover_processes, CaptureConfig, CaptureError, Capturer, DiscoveryError, Process,
    ProcessMatcher, ProcessSource,
};
use crate::{
    coordinator::{Coordinator, CoordinatorError},
    filters::{Input, Pipeline},
    shutdown::Shutdown,
    sink::{Sink, SinkError},
    tap_log,
};

/// Raised once per attached process: anything that can write to its stdin
/// can drive the server.
pub fn stdio_risk_finding(target: &Process) -> Finding {
    Finding::new(
        Severity::High,
        Category::StdioExposure,
        "direct-stdio-access",
        "Direct STDIO Access Risk",
    )
    .with_evidence(format!(
        "MCP servers have direct access to process STDIO, enabling potential command injection \
         (pid {} {})",
        target.pid, target.name
    ))
    .with_pid(Some(target.pid))
    .with_confidence(1.0)
    .with_risk_score(0.63)
    .with_mitigation("Implement message exchange router to isolate STDIO access")
}

/// What one monitoring session saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub pid:       u32,
    pub events:    u64,
    pub findings:  u64,
    /// Chunks the pipeline failed on a critical filter.
    pub blocked:   u64,
    pub forwarded: u64,
}

pub struct StdioMonitor {
    capturer:    Arc<dyn Capturer>,
    pipeline:    Arc<Pipeline>,
    sink:        Arc<dyn Sink>,
    coordinator: Option<Arc<Coordinator>>,
}

impl StdioMonitor {
    pub fn new(capturer: Arc<dyn Capturer>, pipeline: Arc<Pipeline>, sink: Arc<dyn Sink>) -> Self {
        Self { capturer, pipeline, sink, coordinator: None }
    }

    /// Forward chunks that pass the edge stage as analysis tasks.
    pub fn with_coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Attach to `target` and process its traffic until it exits or
    /// shutdown is requested.
    pub async fn monitor(
        &self,
        target: &Process,
        mut shutdown: Shutdown,
    ) -> Result<MonitorReport, CaptureError> {
        let mut session = self.capturer.attach(target).await?;
        tap_log!(
            log::Level::Info,
            "monitor",
            "monitoring pid {} ({}, {}) via {}",
            target.pid,
            target.name,
            target.kind,
            self.capturer.name()
        );

        let mut report = MonitorReport { pid: target.pid, ..Default::default() };
        if let Err(e) = self.sink.write_alert(&stdio_risk_finding(target)).await {
            tap_log!(log::Level::Warn, "monitor", "cannot record exposure finding: {}", e);
        }
        report.findings += 1;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                next = session.next() => match next {
                    Some(ev) => {
                        if let Err(SinkError::Closed) = self.handle(ev, &mut report).await {
                            tap_log!(log::Level::Warn, "monitor", "sink closed; stop monitoring pid {}", target.pid);
                            break;
                        }
                    }
                    None => {
                        tap_log!(log::Level::Info, "monitor", "pid {} stream ended", target.pid);
                        break;
                    }
                }
            }
        }

        session.detach().await;
        Ok(report)
    }

    async fn handle(&self, ev: StreamEvent, report: &mut MonitorReport) -> Result<(), SinkError> {
        report.events += 1;
        metrics::counter!("events_captured_total", "direction" => ev.direction.to_string()).increment(1);
        self.sink.write_event(&ev).await.or_else(tolerate)?;

        let input = Input::Event(ev);
        let stage = self.pipeline.process(&input);
        for finding in &stage.findings {
            report.findings += 1;
            self.sink.write_alert(finding).await.or_else(tolerate)?;
        }
        if !stage.passed {
            report.blocked += 1;
            return Ok(());
        }

        if let (Some(coordinator), Input::Event(ev)) = (&self.coordinator, input) {
            let task = ProcessingTask::new(TaskType::Analyze, format!("pid:{}", ev.pid), ev.data);
            match coordinator.submit(task) {
                Ok(()) => report.forwarded += 1,
                Err(CoordinatorError::QueueFull) => {
                    tap_log!(log::Level::Debug, "monitor", "analysis queue full; chunk from pid {} not forwarded", ev.pid);
                }
                Err(e) => tap_log!(log::Level::Debug, "monitor", "not forwarded: {}", e),
            }
        }
        Ok(())
    }

    /// Monitor one process on its own task. Attach failures are logged and
    /// yield `None`.
    pub fn spawn(self: &Arc<Self>, target: Process, shutdown: Shutdown) -> JoinHandle<Option<MonitorReport>> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            match me.monitor(&target, shutdown).await {
                Ok(report) => Some(report),
                Err(e) => {
                    tap_log!(log::Level::Warn, "monitor", "skipping pid {} ({}): {}", target.pid, target.name, e);
                    None
                }
            }
        })
    }

    /// Monitor a fixed set of processes concurrently.
    pub async fn watch(self: &Arc<Self>, targets: Vec<Process>, shutdown: Shutdown) -> Vec<MonitorReport> {
        let handles: Vec<_> = targets.into_iter().map(|t| self.spawn(t, shutdown.clone())).collect();
        join_all(handles).await.into_iter().filter_map(|r| r.ok().flatten()).collect()
    }

    /// Discover targets now and every `rescan`, attaching to new ones, until
    /// shutdown. Only the first scan's failure is fatal.
    pub async fn watch_discovered(
        self: &Arc<Self>,
        source: Arc<dyn ProcessSource>,
        matcher: ProcessMatcher,
        rescan: Duration,
        mut shutdown: Shutdown,
    ) -> Result<Vec<MonitorReport>, DiscoveryError> {
        let mut live: HashMap<u32, JoinHandle<Option<MonitorReport>>> = HashMap::new();
        let mut reports = Vec::new();
        let mut ticker = interval(rescan);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first = true;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            let found = match discover_processes(source.as_ref(), &matcher) {
                Ok(found) => found,
                Err(e) if first => return Err(e),
                Err(e) => {
                    tap_log!(log::Level::Warn, "monitor", "process scan failed: {}", e);
                    continue;
                }
            };
            if first && found.is_empty() {
                tap_log!(log::Level::Info, "monitor", "no matching processes yet; rescanning every {:?}", rescan);
            }
            first = false;

            let finished: Vec<u32> =
                live.iter().filter(|(_, h)| h.is_finished()).map(|(pid, _)| *pid).collect();
            for pid in finished {
                if let Some(handle) = live.remove(&pid) {
                    if let Ok(Some(report)) = handle.await {
                        reports.push(report);
                    }
                }
            }

            for target in found {
                if !live.contains_key(&target.pid) {
                    let pid = target.pid;
                    live.insert(pid, self.spawn(target, shutdown.clone()));
                }
            }
        }

        for (_, handle) in live {
            if let Ok(Some(report)) = handle.await {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Monitor the configured pids, or keep discovering matching processes
    /// when none are configured. In simulation mode a configured pid that
    /// cannot be read still gets a synthetic target.
    pub async fn run(
        self: &Arc<Self>,
        source: Arc<dyn ProcessSource>,
        cfg: &CaptureConfig,
        shutdown: Shutdown,
    ) -> Result<Vec<MonitorReport>, DiscoveryError> {
        if cfg.pids.is_empty() {
            let matcher = ProcessMatcher::new(&cfg.patterns)?;
            return self.watch_discovered(source, matcher, cfg.rescan_interval, shutdown).await;
        }
        let targets = cfg
            .pids
            .iter()
            .filter_map(|&pid| match source.read_process(pid) {
                Ok(p) => Some(p),
                Err(_) if cfg.simulate => Some(Process::new(pid, 1, "mcp-server", "mcp-server --stdio")),
                Err(e) => {
                    tap_log!(log::Level::Warn, "monitor", "cannot read pid {}: {}", pid, e);
                    None
                }
            })
            .collect();
        Ok(self.watch(targets, shutdown).await)
    }
}

fn tolerate(e: SinkError) -> Result<(), SinkError> {
    match e {
        SinkError::Closed => Err(e),
        other => {
            tap_log!(log::Level::Warn, "monitor", "sink write failed: {}", other);
            Ok(())
        }
    }
}
