//! Captured traffic and the findings raised against it.
//!
//! A `StreamEvent` is created once per observed read/write on a monitored
//! process and is never mutated afterwards. A `Finding` is raised either by a
//! detector in the filter pipeline or by the capture layer itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::fd_label;

/// Which way the bytes travelled, seen from the monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The process read the bytes (stdin, sockets it receives on).
    Inbound,
    /// The process wrote the bytes.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// One chunk of captured I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub timestamp:    DateTime<Utc>,
    pub direction:    Direction,
    pub pid:          u32,
    /// Thread that made the call, when it is not the main thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid:          Option<u32>,
    pub process_name: String,
    pub fd:           i32,
    #[serde(with = "crate::payload")]
    pub data:         Vec<u8>,
    pub size:         usize,
    pub summary:      String,
}

impl StreamEvent {
    /// Build an event stamped with the current time; `size` and `summary`
    /// are derived from the payload.
    pub fn new(
        direction: Direction,
        pid: u32,
        process_name: impl Into<String>,
        fd: i32,
        data: Vec<u8>,
    ) -> Self {
        let size = data.len();
        let verb = match direction {
            Direction::Inbound => "read",
            Direction::Outbound => "write",
        };
        Self {
            timestamp: Utc::now(),
            direction,
            pid,
            tid: None,
            process_name: process_name.into(),
            fd,
            summary: format!("{verb} {size} bytes on {}", fd_label(fd)),
            data,
            size,
        }
    }

    pub fn with_tid(mut self, tid: u32) -> Self {
        self.tid = (tid != self.pid).then_some(tid);
        self
    }

    /// Payload as text, replacing invalid sequences.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Ordered severity scale; `Critical` sorts highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// What kind of problem a finding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    SqlInjection,
    CommandInjection,
    PathTraversal,
    Xss,
    Xxe,
    LdapInjection,
    PromptInjection,
    CredentialExposure,
    SuspiciousKeyword,
    Oversize,
    RateLimit,
    Obfuscation,
    StdioExposure,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::SqlInjection => "sql-injection",
            Category::CommandInjection => "command-injection",
            Category::PathTraversal => "path-traversal",
            Category::Xss => "xss",
            Category::Xxe => "xxe",
            Category::LdapInjection => "ldap-injection",
            Category::PromptInjection => "prompt-injection",
            Category::CredentialExposure => "credential-exposure",
            Category::SuspiciousKeyword => "suspicious-keyword",
            Category::Oversize => "oversize",
            Category::RateLimit => "rate-limit",
            Category::Obfuscation => "obfuscation",
            Category::StdioExposure => "stdio-exposure",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A security finding forwarded to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub timestamp:  DateTime<Utc>,
    pub severity:   Severity,
    pub category:   Category,
    /// Name of the pattern or detector that fired.
    pub pattern:    String,
    pub title:      String,
    pub evidence:   String,
    pub pid:        Option<u32>,
    pub blocked:    bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
}

/// Sinks speak of alerts; the pipeline speaks of findings. Same shape.
pub type SecurityAlert = Finding;

impl Finding {
    pub fn new(
        severity: Severity,
        category: Category,
        pattern: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            category,
            pattern: pattern.into(),
            title: title.into(),
            evidence: String::new(),
            pid: None,
            blocked: false,
            confidence: 1.0,
            mitigation: None,
            risk_score: None,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_mitigation(mut self, mitigation: impl Into<String>) -> Self {
        self.mitigation = Some(mitigation.into());
        self
    }

    pub fn with_risk_score(mut self, score: f64) -> Self {
        self.risk_score = Some(score);
        self
    }

    pub fn blocked(mut self, blocked: bool) -> Self {
        self.blocked = blocked;
        self
    }
}
