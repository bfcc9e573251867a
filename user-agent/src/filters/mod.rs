//! Edge-stage detectors.
//! -----------------------------------------------------------------------------
//! A **filter** inspects one captured chunk and reports whether it matched.
//! Filters are independent of each other and of the pipeline that runs them;
//! the pipeline owns ordering, short-circuiting, statistics and governors.
//!
//! Priorities decide order: every `Critical` filter runs before any `High`
//! one, and so on. A critical match stops the chunk.

pub mod edge;
pub mod patterns;
pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{Category, Severity};
use std::{collections::BTreeMap, fmt, time::Duration};
use thiserror::Error;

use crate::governor::{GovernorConfig, GovernorSnapshot};

pub use edge::{EntropyFilter, KeywordFilter, LengthFilter, PatternFilter, RateLimitFilter};
pub use patterns::{AttackPattern, PatternRegistry};
pub use pipeline::{Input, Pipeline, StageMetrics, StageResult};

/*──────────────────────────── contract ──────────────────────────────────*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        })
    }
}

/// What the pipeline should do with a matching chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Pass,
    Alert,
    Block,
}

/// The bytes under inspection plus where they came from.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    /// Rate-limit key: `pid:<n>` for captured events, caller-chosen otherwise.
    pub source: &'a str,
    pub pid:    Option<u32>,
    pub data:   &'a [u8],
}

impl<'a> Chunk<'a> {
    pub fn new(source: &'a str, data: &'a [u8]) -> Self {
        Self { source, pid: None, data }
    }
}

/// Outcome of one filter invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub matched:    bool,
    pub confidence: f64,
    pub action:     Action,
    pub severity:   Severity,
    /// Short human title for a finding.
    pub detail:     String,
    pub metadata:   BTreeMap<String, String>,
}

impl FilterResult {
    pub fn pass() -> Self {
        Self {
            matched: false,
            confidence: 0.0,
            action: Action::Pass,
            severity: Severity::Low,
            detail: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn hit(action: Action, severity: Severity, confidence: f64, detail: impl Into<String>) -> Self {
        Self {
            matched: true,
            confidence,
            action,
            severity,
            detail: detail.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_owned(), value.to_string());
        self
    }
}

/// Malformed input for a detector. Treated as a non-match.
#[derive(Debug, Error, PartialEq)]
pub enum FilterFault {
    #[error("chunk carries no source identifier")]
    MissingSource,
    #[error("malformed input: {0}")]
    Malformed(String),
}

pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> Priority;
    fn category(&self) -> Category;

    fn evaluate(&self, chunk: &Chunk<'_>) -> Result<FilterResult, FilterFault>;

    /// Suggested remediation attached to findings from this filter.
    fn mitigation(&self) -> Option<&str> {
        None
    }

    /// Bare yes/no answer; faults count as no.
    fn matches(&self, data: &[u8]) -> bool {
        self.evaluate(&Chunk::new("anonymous", data))
            .map(|r| r.matched)
            .unwrap_or(false)
    }
}

/*──────────────────────────── statistics ────────────────────────────────*/

/// Weight of the newest latency sample.
const LATENCY_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterStats {
    pub processed:    u64,
    pub matched:      u64,
    pub faults:       u64,
    pub avg_latency:  Duration,
    pub last_matched: Option<DateTime<Utc>>,
    /// Chunks not evaluated because the governor was shedding.
    pub skipped:      u64,
    pub governor:     Option<GovernorSnapshot>,
}

impl FilterStats {
    pub fn record(&mut self, matched: bool, faulted: bool, latency: Duration) {
        self.avg_latency = if self.processed == 0 {
            latency
        } else {
            self.avg_latency.mul_f64(1.0 - LATENCY_ALPHA) + latency.mul_f64(LATENCY_ALPHA)
        };
        self.processed += 1;
        if faulted {
            self.faults += 1;
        }
        if matched {
            self.matched += 1;
            self.last_matched = Some(Utc::now());
        }
    }
}

/*──────────────────────────── configuration ─────────────────────────────*/

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub max_length:        usize,
    pub rate_limit_rps:    f64,
    pub rate_limit_burst:  u32,
    pub entropy_threshold: f64,
    /// Payloads shorter than this are too small for a meaningful entropy.
    pub entropy_min_len:   usize,
    pub keywords:          Vec<String>,
    pub governor:          GovernorConfig,
}

pub fn default_keywords() -> Vec<String> {
    [
        "ignore previous instructions",
        "ignore all previous instructions",
        "disregard prior instructions",
        "aws_secret_access_key",
        "rm -rf /",
        "chmod 777",
        "nc -e /bin/sh",
        "base64 -d | sh",
        "curl | sh",
        "/dev/tcp/",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_length: shared::constants::DEFAULT_MAX_PAYLOAD,
            rate_limit_rps: 100.0,
            rate_limit_burst: 1000,
            entropy_threshold: shared::constants::DEFAULT_ENTROPY_THRESHOLD,
            entropy_min_len: 32,
            keywords: default_keywords(),
            governor: GovernorConfig::default(),
        }
    }
}

/// Errors while assembling filters or the pattern catalog.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("pattern '{id}' does not compile: {source}")]
    Pattern { id: String, #[source] source: regex::Error },

    #[error("keyword automaton: {0}")]
    Keywords(#[from] aho_corasick::BuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_use_exponential_latency() {
        let mut s = FilterStats::default();
        s.record(false, false, Duration::from_micros(100));
        assert_eq!(s.avg_latency, Duration::from_micros(100));

        s.record(true, false, Duration::from_micros(200));
        let avg = s.avg_latency.as_nanos();
        assert!((109_000..=111_000).contains(&avg), "avg {avg}ns");
        assert_eq!(s.processed, 2);
        assert_eq!(s.matched, 1);
        assert!(s.last_matched.is_some());

        s.record(false, true, Duration::from_micros(110));
        assert_eq!(s.faults, 1);
    }

    #[test]
    fn priorities_order_critical_first() {
        let mut p = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        p.sort_by(|a, b| b.cmp(a));
        assert_eq!(p, vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]);
    }
}
