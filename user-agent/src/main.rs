// src/main.rs

//! Agent entry-point.
//!
//! 1. Load configuration & set up structured logging
//! 2. Optionally expose Prometheus metrics
//! 3. Build the edge and analysis pipelines, the sink and the coordinator
//! 4. Attach to explicit pids, or keep discovering MCP-like processes
//! 5. Wait for Ctrl-C, then shut everything down in order

use agent::{
    capture::{
        Capturer, ProcFs, ProcessSource, SimulatedCapturer, StdioMonitor, StraceCapturer,
    },
    config::{self, Config},
    coordinator::{Coordinator, LocalConnector, NodeSpec},
    filters::{PatternRegistry, Pipeline},
    shutdown::{self, Shutdown},
    sink, tap_log,
};
use anyhow::Context;
use chrono::Local;
use fern::Dispatch;
use log::{Level, LevelFilter};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{path::PathBuf, process, sync::Arc, thread, time::Duration};
use tokio::runtime::Runtime;

const DEFAULT_CONFIG: &str = "stdiotap.toml";
/// Grace period for the coordinator to finish in-flight batches.
const SHUTDOWN_LIMIT: Duration = Duration::from_secs(10);

fn main() {
    if let Err(e) = try_main() {
        eprintln!("[{}][ERROR][stdiotap] {:#}", Local::now().to_rfc3339(), e);
        process::exit(1);
    }
}

fn try_main() -> anyhow::Result<()> {
    let path = std::env::args_os().nth(1).map(PathBuf::from).unwrap_or_else(|| DEFAULT_CONFIG.into());
    let cfg = config::load_or_default(&path).with_context(|| format!("loading {}", path.display()))?;
    setup_logging(&cfg).context("setting up logging")?;

    let rt = Runtime::new().context("creating Tokio runtime")?;
    rt.block_on(run(cfg))
}

/// Configure global logging as requested in `[logging]`. Logs go to stderr so
/// stdout stays free for the JSON-lines sink.
fn setup_logging(cfg: &Config) -> Result<(), fern::InitError> {
    let level = match cfg.logging.level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                process::id(),
                thread::current().id(),
                msg
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if cfg.logging.enable {
        let file = cfg.logging.file.as_deref().unwrap_or("stdiotap.log");
        dispatch = dispatch.chain(fern::log_file(file)?);
    }

    dispatch.apply()?;
    Ok(())
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    if let Some(addr) = cfg.metrics.prometheus_listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("starting Prometheus listener on {addr}"))?;
        tap_log!(Level::Info, "main", "metrics exposed on http://{}/metrics", addr);
    }

    let registry = PatternRegistry::builtin().context("compiling attack patterns")?;
    let pipeline = Arc::new(Pipeline::edge(&cfg.filters, &registry).context("building edge pipeline")?);
    tap_log!(Level::Info, "main", "edge pipeline ready: {}", pipeline.filter_names().join(", "));
    let analysis = Arc::new(Pipeline::analysis(&cfg.filters, &registry).context("building analysis pipeline")?);

    let sink = sink::open(&cfg.output.destination)
        .await
        .with_context(|| format!("opening output '{}'", cfg.output.destination))?;

    let coordinator = Arc::new(Coordinator::start(
        cfg.coordinator.clone(),
        Arc::new(LocalConnector::new(analysis)),
    ));
    let nodes = if cfg.nodes.is_empty() { vec![NodeSpec::new("local-1", 10)] } else { cfg.nodes.clone() };
    for spec in nodes {
        let id = spec.id.clone();
        coordinator.register(spec).await.with_context(|| format!("registering node {id}"))?;
    }

    let (trigger, shutdown) = shutdown::channel();
    let drain = tokio::spawn(log_results(Arc::clone(&coordinator), shutdown.clone()));

    let capturer: Arc<dyn Capturer> = if cfg.capture.simulate {
        tap_log!(Level::Warn, "main", "simulation mode: no real process is traced");
        Arc::new(SimulatedCapturer::new(cfg.capture.simulate_interval))
    } else {
        Arc::new(StraceCapturer::new(&cfg.capture)?)
    };
    let monitor = Arc::new(
        StdioMonitor::new(capturer, Arc::clone(&pipeline), Arc::clone(&sink))
            .with_coordinator(Arc::clone(&coordinator)),
    );

    let watch = {
        let monitor = Arc::clone(&monitor);
        let capture = cfg.capture.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let source: Arc<dyn ProcessSource> = Arc::new(ProcFs::default());
            monitor.run(source, &capture, shutdown).await
        })
    };

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tap_log!(Level::Info, "main", "interrupt received, shutting down");
    trigger.trigger();

    match watch.await {
        Ok(Ok(reports)) => {
            for r in &reports {
                tap_log!(
                    Level::Info,
                    "main",
                    "pid {}: {} events, {} findings, {} blocked, {} forwarded",
                    r.pid,
                    r.events,
                    r.findings,
                    r.blocked,
                    r.forwarded
                );
            }
        }
        Ok(Err(e)) => tap_log!(Level::Error, "main", "process discovery failed: {}", e),
        Err(e) => tap_log!(Level::Error, "main", "monitor task failed: {}", e),
    }

    for (name, g) in pipeline.governors() {
        if g.window_errors > 0 {
            tap_log!(
                Level::Info,
                "main",
                "filter {}: health {:.3}, {}/{} slow or failed{}",
                name,
                g.health,
                g.window_errors,
                g.window_total,
                if g.shedding { ", shedding" } else { "" }
            );
        }
    }

    if let Err(e) = coordinator.shutdown(SHUTDOWN_LIMIT).await {
        tap_log!(Level::Warn, "main", "{}", e);
    }
    let _ = drain.await;
    sink.close().await.context("closing output")?;
    tap_log!(Level::Info, "main", "stopped");
    Ok(())
}

/// Log every coordinator result until shutdown, then whatever is left.
async fn log_results(coordinator: Arc<Coordinator>, mut shutdown: Shutdown) {
    let poll = Duration::from_millis(250);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            r = coordinator.next_result(poll) => {
                if let Some(r) = r {
                    log_result(&r);
                }
            }
        }
    }
    for r in coordinator.drain_results(poll).await {
        log_result(&r);
    }
}

fn log_result(r: &shared::ProcessingResult) {
    if r.success {
        tap_log!(Level::Debug, "main", "task {} done on {} in {}us", r.task_id, r.node_id, r.duration_us);
    } else {
        tap_log!(
            Level::Warn,
            "main",
            "task {} failed on {}: {}",
            r.task_id,
            r.node_id,
            r.error.as_deref().unwrap_or("unknown error")
        );
    }
}
