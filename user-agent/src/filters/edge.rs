// src/filters/edge.rs

//! Concrete edge-stage detectors.

use aho_corasick::AhoCorasick;
use shared::{Category, Severity};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use super::{Action, AttackPattern, BuildError, Chunk, Filter, FilterFault, FilterResult, Priority};

/// Longest excerpt copied into finding metadata.
const EXCERPT_LEN: usize = 120;

fn excerpt(bytes: &[u8]) -> String {
    let cut = &bytes[..bytes.len().min(EXCERPT_LEN)];
    String::from_utf8_lossy(cut).into_owned()
}

/*──────────────────────────── length ────────────────────────────────────*/

/// Rejects oversized payloads before anything else looks at them.
#[derive(Debug)]
pub struct LengthFilter {
    max: usize,
}

impl LengthFilter {
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl Filter for LengthFilter {
    fn name(&self) -> &str {
        "length"
    }
    fn priority(&self) -> Priority {
        Priority::Critical
    }
    fn category(&self) -> Category {
        Category::Oversize
    }

    fn evaluate(&self, chunk: &Chunk<'_>) -> Result<FilterResult, FilterFault> {
        let len = chunk.data.len();
        if len <= self.max {
            return Ok(FilterResult::pass());
        }
        Ok(FilterResult::hit(
            Action::Block,
            Severity::High,
            1.0,
            format!("payload of {len} bytes exceeds limit of {}", self.max),
        )
        .with_meta("length", len)
        .with_meta("limit", self.max))
    }

    fn mitigation(&self) -> Option<&str> {
        Some("Split large messages or raise filters.max_length if the traffic is expected")
    }
}

/*──────────────────────────── rate limit ────────────────────────────────*/

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled: Instant,
}

/// Buckets idle longer than this are dropped when the table grows.
const BUCKET_IDLE: Duration = Duration::from_secs(60);
const BUCKET_SWEEP_AT: usize = 4096;

/// Token bucket per source.
#[derive(Debug)]
pub struct RateLimitFilter {
    rate:    f64,
    burst:   f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimitFilter {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate: rate_per_sec.max(0.0),
            burst: f64::from(burst.max(1)),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn take(&self, source: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if buckets.len() >= BUCKET_SWEEP_AT {
            buckets.retain(|_, b| now.duration_since(b.refilled) < BUCKET_IDLE);
        }
        let b = buckets
            .entry(source.to_owned())
            .or_insert(Bucket { tokens: self.burst, refilled: now });
        let elapsed = now.duration_since(b.refilled).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.rate).min(self.burst);
        b.refilled = now;
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Filter for RateLimitFilter {
    fn name(&self) -> &str {
        "rate-limit"
    }
    fn priority(&self) -> Priority {
        Priority::Critical
    }
    fn category(&self) -> Category {
        Category::RateLimit
    }

    fn evaluate(&self, chunk: &Chunk<'_>) -> Result<FilterResult, FilterFault> {
        if chunk.source.is_empty() {
            return Err(FilterFault::MissingSource);
        }
        if self.take(chunk.source, Instant::now()) {
            return Ok(FilterResult::pass());
        }
        Ok(FilterResult::hit(
            Action::Block,
            Severity::Medium,
            1.0,
            format!("rate limit exceeded for {}", chunk.source),
        )
        .with_meta("source", chunk.source)
        .with_meta("rate", self.rate))
    }

    fn mitigation(&self) -> Option<&str> {
        Some("Throttle the producing process or raise filters.rate_limit_rps")
    }
}

/*──────────────────────────── regex pattern ─────────────────────────────*/

/// One filter per catalog entry.
#[derive(Debug)]
pub struct PatternFilter {
    pattern: Arc<AttackPattern>,
}

impl PatternFilter {
    pub fn new(pattern: Arc<AttackPattern>) -> Self {
        Self { pattern }
    }

    pub fn pattern(&self) -> &AttackPattern {
        &self.pattern
    }
}

impl Filter for PatternFilter {
    fn name(&self) -> &str {
        &self.pattern.id
    }
    fn priority(&self) -> Priority {
        Priority::High
    }
    fn category(&self) -> Category {
        self.pattern.category
    }

    fn evaluate(&self, chunk: &Chunk<'_>) -> Result<FilterResult, FilterFault> {
        let Some(m) = self.pattern.matcher.find(chunk.data) else {
            return Ok(FilterResult::pass());
        };
        let p = &self.pattern;
        let action = if p.severity == Severity::Critical { Action::Block } else { Action::Alert };
        Ok(FilterResult::hit(action, p.severity, p.confidence, p.description.clone())
            .with_meta("pattern_id", &p.id)
            .with_meta("offset", m.start())
            .with_meta("match", excerpt(m.as_bytes())))
    }

    fn mitigation(&self) -> Option<&str> {
        Some(match self.pattern.category {
            Category::SqlInjection => "Use parameterised queries for tool arguments",
            Category::CommandInjection => "Never pass tool arguments to a shell",
            Category::PathTraversal => "Canonicalise paths and confine them to an allow-listed root",
            Category::Xss => "Escape tool output before rendering it",
            Category::Xxe => "Disable external entity resolution in XML parsers",
            Category::LdapInjection => "Escape LDAP filter metacharacters",
            Category::PromptInjection => "Treat tool output as data, never as instructions",
            Category::CredentialExposure => "Rotate the exposed credential",
            _ => "Review the flagged traffic",
        })
    }
}

/*──────────────────────────── keywords ──────────────────────────────────*/

/// Case-insensitive multi-keyword scan.
#[derive(Debug)]
pub struct KeywordFilter {
    keywords:  Vec<String>,
    automaton: AhoCorasick,
}

impl KeywordFilter {
    pub fn new(keywords: Vec<String>) -> Result<Self, BuildError> {
        let automaton = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(&keywords)?;
        Ok(Self { keywords, automaton })
    }
}

impl Filter for KeywordFilter {
    fn name(&self) -> &str {
        "keyword"
    }
    fn priority(&self) -> Priority {
        Priority::Medium
    }
    fn category(&self) -> Category {
        Category::SuspiciousKeyword
    }

    fn evaluate(&self, chunk: &Chunk<'_>) -> Result<FilterResult, FilterFault> {
        let mut hits: Vec<&str> = Vec::new();
        for m in self.automaton.find_iter(chunk.data) {
            let kw = self.keywords[m.pattern().as_usize()].as_str();
            if !hits.contains(&kw) {
                hits.push(kw);
            }
        }
        if hits.is_empty() {
            return Ok(FilterResult::pass());
        }
        let confidence = (0.5 + 0.15 * hits.len() as f64).min(0.95);
        Ok(FilterResult::hit(
            Action::Alert,
            Severity::Medium,
            confidence,
            format!("suspicious keyword '{}'", hits[0]),
        )
        .with_meta("match", hits.join(", ")))
    }
}

/*──────────────────────────── entropy ───────────────────────────────────*/

/// Shannon entropy of the byte histogram, in bits per byte (0.0 ..= 8.0).
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut hist = [0u64; 256];
    for &b in data {
        hist[b as usize] += 1;
    }
    let len = data.len() as f64;
    hist.iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Flags likely encrypted, compressed or obfuscated payloads.
#[derive(Debug)]
pub struct EntropyFilter {
    threshold: f64,
    min_len:   usize,
}

impl EntropyFilter {
    pub fn new(threshold: f64, min_len: usize) -> Self {
        Self { threshold, min_len }
    }
}

impl Filter for EntropyFilter {
    fn name(&self) -> &str {
        "entropy"
    }
    fn priority(&self) -> Priority {
        Priority::Low
    }
    fn category(&self) -> Category {
        Category::Obfuscation
    }

    fn evaluate(&self, chunk: &Chunk<'_>) -> Result<FilterResult, FilterFault> {
        if chunk.data.len() < self.min_len {
            return Ok(FilterResult::pass());
        }
        let bits = shannon_entropy(chunk.data);
        if bits <= self.threshold {
            return Ok(FilterResult::pass().with_meta("entropy", format!("{bits:.3}")));
        }
        let span = (8.0 - self.threshold).max(f64::EPSILON);
        let confidence = ((bits - self.threshold) / span).clamp(0.1, 1.0);
        Ok(FilterResult::hit(
            Action::Alert,
            Severity::Low,
            confidence,
            format!("high entropy payload ({bits:.2} bits/byte)"),
        )
        .with_meta("entropy", format!("{bits:.3}"))
        .with_meta("match", hex::encode(&chunk.data[..chunk.data.len().min(32)])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::PatternRegistry;
    use rand::Rng;

    #[test]
    fn length_blocks_only_above_limit() {
        let f = LengthFilter::new(16);
        assert!(!f.matches(&[b'a'; 16]));
        let r = f.evaluate(&Chunk::new("s", &[b'a'; 17])).unwrap();
        assert!(r.matched);
        assert_eq!(r.action, Action::Block);
        assert_eq!(r.metadata["length"], "17");
    }

    #[test]
    fn rate_limit_is_per_source() {
        let f = RateLimitFilter::new(0.0, 2);
        assert!(!f.matches_from("pid:1"));
        assert!(!f.matches_from("pid:1"));
        assert!(f.matches_from("pid:1"));
        // another source has its own bucket
        assert!(!f.matches_from("pid:2"));
    }

    #[test]
    fn rate_limit_refills() {
        let f = RateLimitFilter::new(1000.0, 1);
        assert!(!f.matches_from("a"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!f.matches_from("a"));
    }

    #[test]
    fn rate_limit_without_source_faults() {
        let f = RateLimitFilter::new(10.0, 10);
        assert_eq!(f.evaluate(&Chunk::new("", b"x")), Err(FilterFault::MissingSource));
        assert!(!f.matches(b"x"));
    }

    impl RateLimitFilter {
        fn matches_from(&self, source: &str) -> bool {
            self.evaluate(&Chunk::new(source, b"x")).unwrap().matched
        }
    }

    #[test]
    fn pattern_filter_reports_match_excerpt() {
        let reg = PatternRegistry::builtin().unwrap();
        let f = PatternFilter::new(reg.get("sql-union-1").unwrap().clone());
        let r = f.evaluate(&Chunk::new("s", b"q=1 union select * from t")).unwrap();
        assert!(r.matched);
        assert_eq!(r.severity, Severity::Critical);
        assert_eq!(r.metadata["match"], "union select");
        assert_eq!(r.metadata["offset"], "4");
    }

    #[test]
    fn keyword_filter_is_case_insensitive() {
        let f = KeywordFilter::new(vec!["rm -rf /".into(), "chmod 777".into()]).unwrap();
        let r = f.evaluate(&Chunk::new("s", b"then CHMOD 777 the dir")).unwrap();
        assert!(r.matched);
        assert_eq!(r.metadata["match"], "chmod 777");
        assert!(!f.matches(b"change the mode of the file"));
    }

    #[test]
    fn repeated_keywords_are_reported_once() {
        let f = KeywordFilter::new(vec!["rm -rf /".into(), "chmod 777".into()]).unwrap();
        let r = f.evaluate(&Chunk::new("s", b"chmod 777 a; rm -rf /; chmod 777 b")).unwrap();
        assert_eq!(r.metadata["match"], "chmod 777, rm -rf /");
        assert!((r.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn random_bytes_have_high_entropy() {
        let mut buf = [0u8; 1024];
        rand::thread_rng().fill(&mut buf[..]);
        let bits = shannon_entropy(&buf);
        assert!(bits > 7.5, "entropy {bits}");

        let f = EntropyFilter::new(7.0, 32);
        assert!(f.matches(&buf));
    }

    #[test]
    fn repeated_byte_has_zero_entropy() {
        let buf = [0x41u8; 1024];
        assert_eq!(shannon_entropy(&buf), 0.0);
        assert!(!EntropyFilter::new(7.0, 32).matches(&buf));
    }

    #[test]
    fn short_payloads_skip_entropy() {
        let f = EntropyFilter::new(1.0, 32);
        assert!(!f.matches(b"abcdefgh"));
    }
}
