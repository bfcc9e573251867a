// src/filters/pipeline.rs

//! Ordered filter chain for one stage.
//!
//! Filters are kept sorted by priority (critical first, insertion order
//! within a priority). Each slot carries its own statistics lock so one
//! filter's bookkeeping never waits on another's, plus an optional adaptive
//! governor that may skip the filter while it is misbehaving.

use log::Level;
use serde::{Deserialize, Serialize};
use shared::{Finding, StreamEvent};
use std::{
    borrow::Cow,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use super::{
    Action, BuildError, Chunk, EntropyFilter, Filter, FilterConfig, FilterResult, FilterStats,
    KeywordFilter, LengthFilter, PatternFilter, PatternRegistry, Priority, RateLimitFilter,
};
use crate::governor::{AdaptiveGovernor, GovernorConfig, GovernorSnapshot};
use crate::tap_log;

/// Source key used when the input does not say where it came from.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Everything the pipeline accepts, one variant per input kind.
#[derive(Debug, Clone)]
pub enum Input {
    Event(StreamEvent),
    Raw { source: String, data: Vec<u8> },
    /// Structured record; its JSON encoding is inspected.
    Record(serde_json::Value),
}

impl Input {
    pub fn raw(source: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Input::Raw { source: source.into(), data: data.into() }
    }

    pub fn source(&self) -> Cow<'_, str> {
        match self {
            Input::Event(ev) => Cow::Owned(format!("pid:{}", ev.pid)),
            Input::Raw { source, .. } if !source.is_empty() => Cow::Borrowed(source),
            Input::Raw { .. } => Cow::Borrowed(UNKNOWN_SOURCE),
            Input::Record(v) => Cow::Borrowed(
                v.get("source").and_then(|s| s.as_str()).unwrap_or(UNKNOWN_SOURCE),
            ),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Input::Event(ev) => Some(ev.pid),
            Input::Raw { .. } => None,
            Input::Record(v) => v.get("pid").and_then(|p| p.as_u64()).and_then(|p| u32::try_from(p).ok()),
        }
    }

    pub fn bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Input::Event(ev) => Cow::Borrowed(&ev.data),
            Input::Raw { data, .. } => Cow::Borrowed(data),
            Input::Record(v) => Cow::Owned(v.to_string().into_bytes()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub filters_run: usize,
    pub elapsed_us:  u64,
}

/// Aggregate outcome of one chunk through one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage:      String,
    pub passed:     bool,
    pub confidence: f64,
    pub findings:   Vec<Finding>,
    /// Filters a governor skipped for this chunk.
    pub skipped:    Vec<String>,
    pub metrics:    StageMetrics,
}

struct Slot {
    filter:   Box<dyn Filter>,
    stats:    Mutex<FilterStats>,
    governor: Option<AdaptiveGovernor>,
}

pub struct Pipeline {
    name:  String,
    slots: Vec<Slot>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), slots: Vec::new() }
    }

    /// The standard edge stage: length, rate, one filter per catalog pattern,
    /// keywords, entropy. Everything below critical priority is governed.
    pub fn edge(cfg: &FilterConfig, registry: &PatternRegistry) -> Result<Self, BuildError> {
        let gov = Some(&cfg.governor);
        let mut p = Pipeline::new("edge");
        p.add(Box::new(LengthFilter::new(cfg.max_length)), None);
        p.add(Box::new(RateLimitFilter::new(cfg.rate_limit_rps, cfg.rate_limit_burst)), None);
        for pattern in registry.iter() {
            p.add(Box::new(PatternFilter::new(pattern.clone())), gov);
        }
        if !cfg.keywords.is_empty() {
            p.add(Box::new(KeywordFilter::new(cfg.keywords.clone())?), gov);
        }
        p.add(Box::new(EntropyFilter::new(cfg.entropy_threshold, cfg.entropy_min_len)), gov);
        tap_log!(Level::Debug, "pipeline", "edge stage built with {} filters", p.len());
        Ok(p)
    }

    /// Worker-side stage: the edge checks minus rate limiting, with no
    /// governors. Edge admission already charged the source for the chunk.
    pub fn analysis(cfg: &FilterConfig, registry: &PatternRegistry) -> Result<Self, BuildError> {
        let mut p = Pipeline::new("analysis");
        p.add(Box::new(LengthFilter::new(cfg.max_length)), None);
        for pattern in registry.iter() {
            p.add(Box::new(PatternFilter::new(pattern.clone())), None);
        }
        if !cfg.keywords.is_empty() {
            p.add(Box::new(KeywordFilter::new(cfg.keywords.clone())?), None);
        }
        p.add(Box::new(EntropyFilter::new(cfg.entropy_threshold, cfg.entropy_min_len)), None);
        tap_log!(Level::Debug, "pipeline", "analysis stage built with {} filters", p.len());
        Ok(p)
    }

    /// Insert keeping priority order; equal priorities keep insertion order.
    pub fn add(&mut self, filter: Box<dyn Filter>, governor: Option<&GovernorConfig>) {
        let prio = filter.priority();
        let at = self
            .slots
            .iter()
            .position(|s| s.filter.priority() < prio)
            .unwrap_or(self.slots.len());
        self.slots.insert(
            at,
            Slot {
                filter,
                stats: Mutex::new(FilterStats::default()),
                governor: governor.cloned().map(AdaptiveGovernor::new),
            },
        );
    }

    pub fn with(mut self, filter: Box<dyn Filter>) -> Self {
        self.add(filter, None);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Filter names in execution order.
    pub fn filter_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.filter.name()).collect()
    }

    /// Per-filter statistics, with the governor's view for governed filters.
    pub fn stats(&self) -> Vec<(String, FilterStats)> {
        self.slots
            .iter()
            .map(|s| {
                let mut st = s.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
                st.governor = s.governor.as_ref().map(AdaptiveGovernor::snapshot);
                (s.filter.name().to_owned(), st)
            })
            .collect()
    }

    pub fn governors(&self) -> Vec<(String, GovernorSnapshot)> {
        self.slots
            .iter()
            .filter_map(|s| Some((s.filter.name().to_owned(), s.governor.as_ref()?.snapshot())))
            .collect()
    }

    pub fn process(&self, input: &Input) -> StageResult {
        let data = input.bytes();
        let source = input.source();
        let chunk = Chunk { source: &source, pid: input.pid(), data: &data };
        self.inspect(&chunk)
    }

    pub fn inspect(&self, chunk: &Chunk<'_>) -> StageResult {
        let started = Instant::now();
        let mut out = StageResult {
            stage: self.name.clone(),
            passed: true,
            confidence: 0.0,
            findings: Vec::new(),
            skipped: Vec::new(),
            metrics: StageMetrics::default(),
        };

        for slot in &self.slots {
            if slot.governor.as_ref().is_some_and(|g| !g.should_process()) {
                slot.stats.lock().unwrap_or_else(PoisonError::into_inner).skipped += 1;
                metrics::counter!("filter_skipped_total", "filter" => slot.filter.name().to_owned())
                    .increment(1);
                out.skipped.push(slot.filter.name().to_owned());
                continue;
            }

            let t0 = Instant::now();
            let outcome = slot.filter.evaluate(chunk);
            let latency = t0.elapsed();
            out.metrics.filters_run += 1;

            let (matched, faulted) = match &outcome {
                Ok(r) => (r.matched, false),
                Err(_) => (false, true),
            };
            slot.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(matched, faulted, latency);
            if let Some(g) = &slot.governor {
                g.on_result(&outcome, latency);
                metrics::gauge!("filter_governor_health", "filter" => slot.filter.name().to_owned())
                    .set(g.health());
            }

            let result = match outcome {
                Ok(r) if r.matched => r,
                Ok(_) => continue,
                Err(fault) => {
                    tap_log!(Level::Debug, "pipeline", "filter '{}' fault: {}", slot.filter.name(), fault);
                    metrics::counter!("filter_faults_total", "filter" => slot.filter.name().to_owned())
                        .increment(1);
                    continue;
                }
            };

            out.confidence = out.confidence.max(result.confidence);
            let finding = to_finding(slot.filter.as_ref(), chunk, result);
            metrics::counter!("findings_total", "severity" => finding.severity.to_string())
                .increment(1);
            out.findings.push(finding);

            if slot.filter.priority() == Priority::Critical {
                out.passed = false;
                break;
            }
        }

        out.metrics.elapsed_us = duration_us(started.elapsed());
        metrics::counter!("pipeline_chunks_total", "stage" => self.name.clone()).increment(1);
        out
    }
}

fn duration_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn to_finding(filter: &dyn Filter, chunk: &Chunk<'_>, r: FilterResult) -> Finding {
    let evidence = r
        .metadata
        .get("match")
        .cloned()
        .unwrap_or_else(|| evidence_of(chunk.data));
    let mut f = Finding::new(r.severity, filter.category(), filter.name(), r.detail)
        .with_evidence(evidence)
        .with_pid(chunk.pid)
        .with_confidence(r.confidence)
        .blocked(r.action == Action::Block);
    if let Some(m) = filter.mitigation() {
        f = f.with_mitigation(m);
    }
    f
}

/// Short printable excerpt, hex when the bytes are not text.
fn evidence_of(data: &[u8]) -> String {
    let cut = &data[..data.len().min(64)];
    match std::str::from_utf8(cut) {
        Ok(s) => s.to_owned(),
        Err(_) => hex::encode(cut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterFault;
    use shared::{Category, Direction, Severity};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn edge() -> Pipeline {
        let reg = PatternRegistry::builtin().unwrap();
        Pipeline::edge(&FilterConfig { max_length: 64, ..FilterConfig::default() }, &reg).unwrap()
    }

    /// Counts invocations and always matches.
    struct Probe {
        name:  &'static str,
        prio:  Priority,
        calls: Arc<AtomicUsize>,
        fault: bool,
    }

    impl Filter for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> Priority {
            self.prio
        }
        fn category(&self) -> Category {
            Category::SuspiciousKeyword
        }
        fn evaluate(&self, _: &Chunk<'_>) -> Result<FilterResult, FilterFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fault {
                return Err(FilterFault::Malformed("bad".into()));
            }
            Ok(FilterResult::hit(Action::Alert, Severity::Low, 0.4, self.name))
        }
    }

    fn probe(name: &'static str, prio: Priority, fault: bool) -> (Box<dyn Filter>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Box::new(Probe { name, prio, calls: calls.clone(), fault }), calls)
    }

    #[test]
    fn oversize_payload_short_circuits_regardless_of_content() {
        let p = edge();
        for body in [vec![b'a'; 65], b"x UNION SELECT y ".repeat(10)] {
            let r = p.process(&Input::raw("t", body));
            assert!(!r.passed);
            assert_eq!(r.findings.len(), 1);
            assert_eq!(r.findings[0].category, Category::Oversize);
            assert_eq!(r.metrics.filters_run, 1);
        }
    }

    #[test]
    fn union_select_is_critical() {
        let p = edge();
        let ev = StreamEvent::new(Direction::Inbound, 77, "srv", 0, b"id=1 UNION SELECT name".to_vec());
        let r = p.process(&Input::Event(ev));
        let crit: Vec<_> = r.findings.iter().filter(|f| f.severity == Severity::Critical).collect();
        assert_eq!(crit.len(), 1);
        assert_eq!(crit[0].pattern, "sql-union-1");
        assert_eq!(crit[0].pid, Some(77));
        assert!(r.passed, "high-priority matches do not stop the stage");
    }

    #[test]
    fn documentation_text_has_no_findings() {
        let reg = PatternRegistry::builtin().unwrap();
        let p = Pipeline::edge(&FilterConfig::default(), &reg).unwrap();
        let doc = "## Usage\n\nRun the server with the default profile. The handler reads a \
                   request, selects the matching route and writes a response. Union types \
                   are described in the reference chapter.\n";
        let r = p.process(&Input::raw("docs", doc));
        assert!(r.findings.is_empty(), "{:?}", r.findings);
        assert!(r.passed);
    }

    #[test]
    fn analysis_stage_has_no_rate_limit() {
        let reg = PatternRegistry::builtin().unwrap();
        let edge = Pipeline::edge(&FilterConfig::default(), &reg).unwrap();
        let analysis = Pipeline::analysis(&FilterConfig::default(), &reg).unwrap();
        assert!(edge.filter_names().contains(&"rate-limit"));
        assert!(!analysis.filter_names().contains(&"rate-limit"));
        assert_eq!(analysis.len(), edge.len() - 1);
        assert!(analysis.governors().is_empty());
    }

    #[test]
    fn filters_run_in_priority_order_and_critical_stops() {
        let (low, low_calls) = probe("low", Priority::Low, false);
        let (crit, crit_calls) = probe("crit", Priority::Critical, false);
        let (high, high_calls) = probe("high", Priority::High, false);
        let p = Pipeline::new("t").with(low).with(high).with(crit);
        assert_eq!(p.filter_names(), vec!["crit", "high", "low"]);

        let r = p.process(&Input::raw("s", "x"));
        assert!(!r.passed);
        assert_eq!(crit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(high_calls.load(Ordering::SeqCst), 0);
        assert_eq!(low_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lower_priority_matches_accumulate() {
        let (a, _) = probe("a", Priority::High, false);
        let (b, _) = probe("b", Priority::Low, false);
        let p = Pipeline::new("t").with(b).with(a);
        let r = p.process(&Input::raw("s", "x"));
        assert!(r.passed);
        let names: Vec<_> = r.findings.iter().map(|f| f.pattern.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn faults_are_non_matches() {
        let (bad, bad_calls) = probe("bad", Priority::Critical, true);
        let (next, next_calls) = probe("next", Priority::Low, false);
        let p = Pipeline::new("t").with(bad).with(next);
        let r = p.process(&Input::raw("s", "x"));
        assert!(r.passed);
        assert_eq!(bad_calls.load(Ordering::SeqCst), 1);
        assert_eq!(next_calls.load(Ordering::SeqCst), 1);
        let stats = p.stats();
        assert_eq!(stats[0].1.faults, 1);
        assert_eq!(stats[0].1.matched, 0);
    }

    /// Matches nothing; takes much longer on chunks containing "slow".
    struct Sluggish;

    impl Filter for Sluggish {
        fn name(&self) -> &str {
            "sluggish"
        }
        fn priority(&self) -> Priority {
            Priority::Low
        }
        fn category(&self) -> Category {
            Category::SuspiciousKeyword
        }
        fn evaluate(&self, chunk: &Chunk<'_>) -> Result<FilterResult, FilterFault> {
            let pause = if chunk.data.windows(4).any(|w| w == b"slow") { 50 } else { 2 };
            std::thread::sleep(Duration::from_millis(pause));
            Ok(FilterResult::pass())
        }
    }

    #[test]
    fn latency_spike_is_visible_in_governor_stats() {
        // no cooldown, so the slow chunks are never skipped
        let gov = GovernorConfig {
            recovery_delay: Duration::ZERO,
            smoothing: 0.5,
            baseline_rps: 0.01,
            ..GovernorConfig::default()
        };
        let mut p = Pipeline::new("t");
        p.add(Box::new(Sluggish), Some(&gov));

        for _ in 0..5 {
            p.process(&Input::raw("s", "fast"));
        }
        let calm = p.governors()[0].1;

        for _ in 0..3 {
            p.process(&Input::raw("s", "slow"));
        }
        let governors = p.governors();
        let (name, snap) = &governors[0];
        assert_eq!(name, "sluggish");
        assert!(snap.window_errors > calm.window_errors, "{snap:?}");
        assert!(snap.health < 1.0);

        let stats = p.stats();
        assert_eq!(stats[0].1.governor.as_ref().map(|g| g.window_total), Some(snap.window_total));
    }

    #[test]
    fn shedding_filter_is_counted_as_skipped() {
        let (bad, calls) = probe("bad", Priority::Low, true);
        let gov = GovernorConfig {
            recovery_delay: Duration::from_secs(60),
            smoothing: 0.5,
            baseline_rps: 0.01,
            ..GovernorConfig::default()
        };
        let mut p = Pipeline::new("t");
        p.add(bad, Some(&gov));

        let mut skipped = 0;
        for _ in 0..20 {
            skipped += p.process(&Input::raw("s", "x")).skipped.len() as u64;
        }
        assert!(skipped > 0);
        let stats = p.stats();
        let st = &stats[0].1;
        assert_eq!(st.skipped, skipped);
        assert_eq!(st.processed + st.skipped, 20);
        assert_eq!(calls.load(Ordering::SeqCst) as u64, st.processed);
        assert!(st.governor.unwrap().shedding);
    }

    #[test]
    fn record_input_uses_its_source_field() {
        let v = serde_json::json!({ "source": "peer-a", "pid": 9, "method": "tools/call" });
        let input = Input::Record(v);
        assert_eq!(input.source(), "peer-a");
        assert_eq!(input.pid(), Some(9));
        assert!(String::from_utf8_lossy(&input.bytes()).contains("tools/call"));
        assert_eq!(Input::raw("", "x").source(), UNKNOWN_SOURCE);
    }
}
