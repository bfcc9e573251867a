// tests/capture.rs

//! Discovery → capture → edge pipeline → sink, with analysis forwarded to a
//! coordinator running in-process workers.

use agent::capture::{
    strace::StraceParser, ChannelCapturer, Process, ProcessMatcher, StaticProcessSource,
    StdioMonitor,
};
use agent::coordinator::{Coordinator, CoordinatorConfig, LocalConnector, NodeSpec};
use agent::filters::{FilterConfig, PatternRegistry, Pipeline, StageResult};
use agent::shutdown;
use agent::sink::MemorySink;
use shared::{Category, Direction, StreamEvent};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;

fn pipelines() -> (Arc<Pipeline>, Arc<Pipeline>) {
    let registry = PatternRegistry::builtin().unwrap();
    let cfg = FilterConfig::default();
    (
        Arc::new(Pipeline::edge(&cfg, &registry).unwrap()),
        Arc::new(Pipeline::analysis(&cfg, &registry).unwrap()),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovered_server_is_monitored_end_to_end() {
    let (pipeline, analysis) = pipelines();
    let coordinator = Arc::new(Coordinator::start(
        CoordinatorConfig { batch_timeout: Duration::from_millis(10), ..CoordinatorConfig::default() },
        Arc::new(LocalConnector::new(Arc::clone(&analysis))),
    ));
    coordinator.register(NodeSpec::new("local-1", 8)).await.unwrap();

    let source = Arc::new(StaticProcessSource::new([
        Process::new(300, 1, "node", "node /opt/fs/mcp-server.js --stdio"),
        Process::new(301, 1, "bash", "bash -l"),
    ]));
    let matcher = ProcessMatcher::new(&["*mcp-server*"]).unwrap();

    let capturer = Arc::new(ChannelCapturer::new());
    let tx = capturer.feed(300);
    let sink = Arc::new(MemorySink::new());
    let monitor = Arc::new(
        StdioMonitor::new(capturer, Arc::clone(&pipeline), sink.clone())
            .with_coordinator(Arc::clone(&coordinator)),
    );

    let (trigger, shutdown) = shutdown::channel();
    let watching = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            monitor.watch_discovered(source, matcher, Duration::from_millis(20), shutdown).await
        })
    };

    let request = br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#.to_vec();
    let attack = br#"{"method":"tools/call","params":{"path":"../../../var/app/secrets.txt"}}"#.to_vec();
    tx.send(StreamEvent::new(Direction::Inbound, 300, "node", 0, request)).unwrap();
    tx.send(StreamEvent::new(Direction::Inbound, 300, "node", 0, attack)).unwrap();
    drop(tx);

    let mut results = Vec::new();
    while results.len() < 2 {
        match coordinator.next_result(Duration::from_secs(2)).await {
            Some(r) => results.push(r),
            None => panic!("only {} analysis results arrived", results.len()),
        }
    }
    sleep(Duration::from_millis(50)).await;
    trigger.trigger();
    let reports = watching.await.unwrap().unwrap();

    let report = reports.iter().find(|r| r.pid == 300).expect("report for the server");
    assert_eq!(report.events, 2);
    assert!(reports.iter().all(|r| r.pid != 301));

    assert_eq!(sink.events().len(), 2);
    let alerts = sink.alerts();
    assert!(alerts.iter().any(|a| a.category == Category::StdioExposure && a.pid == Some(300)));
    assert!(alerts.iter().any(|a| a.category == Category::PathTraversal));

    assert!(results.iter().all(|r| r.success && r.node_id == "local-1"));
    let analysed: Vec<StageResult> =
        results.iter().map(|r| serde_json::from_slice(&r.output).unwrap()).collect();
    assert!(analysed.iter().all(|s| s.stage == "analysis"));
    assert!(analysed.iter().any(|s| !s.findings.is_empty()));

    // each chunk was charged to the edge rate limiter exactly once
    let stats = pipeline.stats();
    let rate = stats.iter().find(|(name, _)| name == "rate-limit").unwrap();
    assert_eq!(rate.1.processed, 2);
    assert!(analysis.stats().iter().all(|(name, _)| name != "rate-limit"));

    coordinator.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[test]
fn replayed_strace_output_yields_stdio_events() {
    let log = [
        r#"[pid  812] read(0, "\x7b\x22\x69\x64\x22\x3a\x31\x7d\x0a", 65536) = 9"#,
        r#"[pid  812] write(3, "\x78", 1) = 1"#,
        r#"[pid  813] write(1,  <unfinished ...>"#,
        r#"[pid  812] read(0, "", 65536) = 0"#,
        r#"[pid  813] <... write resumed>"\x6f\x6b\x0a", 3) = 3"#,
        "+++ exited with 0 +++",
    ];
    let mut parser = StraceParser::standalone(812, "mcp-server", true).unwrap();
    let events: Vec<StreamEvent> = log.iter().filter_map(|l| parser.feed(l)).collect();

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].direction, Direction::Inbound);
    assert_eq!(events[0].data, b"{\"id\":1}\n");
    assert_eq!(events[0].summary, "read 9 bytes on stdin");
    assert!(events.iter().all(|e| e.pid == 812));
    assert_eq!(events[0].tid, None);
    assert_eq!(events[1].tid, Some(813));
    assert_eq!(events[1].direction, Direction::Outbound);
    assert_eq!(events[1].text(), "ok\n");
    assert_eq!(parser.pending(), 0);
}
