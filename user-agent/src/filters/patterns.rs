// src/filters/patterns.rs

//! # Attack Pattern Catalog
//!
//! Static catalog compiled once into a [`PatternRegistry`] value. The
//! registry is built at startup and handed by reference to whoever needs it
//! (the edge pipeline, in-process workers); there is no global instance.
//!
//! Expressions are deliberately narrow: a bare `--`, a lone metacharacter or
//! any inline code span would fire on ordinary documentation, so each entry
//! requires the surrounding shape of an actual attack.

use log::Level;
use regex::bytes::Regex;
use shared::{Category, Severity};
use std::sync::Arc;

use super::BuildError;
use crate::tap_log;

/// One compiled catalog entry.
#[derive(Debug)]
pub struct AttackPattern {
    pub id:          String,
    pub category:    Category,
    pub severity:    Severity,
    pub confidence:  f64,
    pub description: String,
    pub matcher:     Regex,
}

/// Uncompiled catalog row.
#[derive(Debug, Clone, Copy)]
pub struct PatternSpec {
    pub id:          &'static str,
    pub category:    Category,
    pub severity:    Severity,
    pub confidence:  f64,
    pub description: &'static str,
    pub expr:        &'static str,
}

const fn spec(
    id: &'static str,
    category: Category,
    severity: Severity,
    confidence: f64,
    description: &'static str,
    expr: &'static str,
) -> PatternSpec {
    PatternSpec { id, category, severity, confidence, description, expr }
}

use Category::*;
use Severity::{Critical, High, Medium};

pub const BUILTIN: &[PatternSpec] = &[
    // ── SQL injection ───────────────────────────────────────────────────
    spec("sql-union-1", SqlInjection, Critical, 0.95, "SQL UNION SELECT injection",
         r"(?i)\bUNION\s+(ALL\s+)?SELECT\b"),
    spec("sql-or-1", SqlInjection, High, 0.90, "SQL tautology injection",
         r"(?i)'\s*OR\s+'?\d+'?\s*=\s*'?\d+"),
    spec("sql-comment-1", SqlInjection, Medium, 0.70, "SQL comment after string terminator",
         r"'\s*(--|#|/\*)"),
    spec("sql-ddl-1", SqlInjection, Critical, 0.98, "SQL DDL injection",
         r"(?i)\b(DROP|TRUNCATE|ALTER)\s+(TABLE|DATABASE|SCHEMA|INDEX|VIEW)\b"),
    spec("sql-time-1", SqlInjection, High, 0.85, "SQL time-based injection",
         r"(?i)\b(SLEEP|BENCHMARK|WAITFOR\s+DELAY|PG_SLEEP)\s*\("),
    spec("sql-meta-1", SqlInjection, High, 0.80, "SQL metadata access",
         r"(?i)\b(INFORMATION_SCHEMA|SYSOBJECTS|SYSCOLUMNS|SYSUSERS)\b"),
    // ── command injection ───────────────────────────────────────────────
    spec("cmd-semicolon-1", CommandInjection, Critical, 0.95, "Command chaining with semicolon",
         r";\s*(cat|ls|pwd|whoami|id|uname|wget|curl|nc|ncat)\b"),
    spec("cmd-pipe-1", CommandInjection, High, 0.85, "Output piped into a shell",
         r"\|\s*(ba|z|da)?sh\b"),
    spec("cmd-backtick-1", CommandInjection, High, 0.80, "Command substitution with backticks",
         r"`\s*(cat|ls|id|whoami|uname|curl|wget|nc)\b[^`]*`"),
    spec("cmd-dollar-1", CommandInjection, High, 0.80, "Command substitution with $()",
         r"\$\(\s*(cat|ls|id|whoami|uname|curl|wget|nc|bash|sh)\b[^)]*\)"),
    // ── path traversal ──────────────────────────────────────────────────
    spec("path-dotdot-1", PathTraversal, High, 0.90, "Directory traversal with ../",
         r"(\.\.[/\\]){2,}"),
    spec("path-sensitive-1", PathTraversal, Critical, 0.95, "Path to sensitive system file",
         r"/etc/(passwd|shadow|sudoers)\b"),
    spec("path-windows-1", PathTraversal, High, 0.85, "Windows system path access",
         r"(?i)c:\\+(windows\\+system32|winnt|boot\.ini)"),
    spec("path-encoded-1", PathTraversal, High, 0.85, "URL encoded path traversal",
         r"(?i)%2e%2e(%2f|%5c)|%252e%252e(%252f|%255c)"),
    spec("path-unicode-1", PathTraversal, Medium, 0.80, "Unicode encoded traversal",
         r"(?i)\\u002e\\u002e(\\u002f|\\u005c)"),
    // ── XSS ─────────────────────────────────────────────────────────────
    spec("xss-script-1", Xss, Critical, 0.95, "Script tag injection",
         r"(?is)<script[^>]*>.*?</script>"),
    spec("xss-event-1", Xss, High, 0.90, "Event handler injection",
         r"(?i)<[a-z][^>]*\son(load|error|click|mouse\w+|key\w+)\s*="),
    spec("xss-protocol-1", Xss, High, 0.85, "Script protocol injection",
         r"(?i)\b(javascript|vbscript|livescript)\s*:[^/\s]"),
    spec("xss-img-1", Xss, High, 0.85, "Image tag with error handler",
         r"(?i)<img[^>]+src[^>]+onerror\s*="),
    // ── XXE ─────────────────────────────────────────────────────────────
    spec("xxe-entity-1", Xxe, Critical, 0.95, "External entity declaration",
         r"(?i)<!ENTITY\s+%?\s*\S+\s+(SYSTEM|PUBLIC)\b"),
    spec("xxe-doctype-1", Xxe, Medium, 0.70, "Inline DOCTYPE subset",
         r"(?i)<!DOCTYPE\s+\w+\s*\["),
    // ── LDAP injection ──────────────────────────────────────────────────
    spec("ldap-filter-1", LdapInjection, High, 0.85, "LDAP filter break-out",
         r"\*\)\s*\(\s*[|&]"),
    spec("ldap-wildcard-1", LdapInjection, Medium, 0.75, "LDAP wildcard on identity attribute",
         r"(?i)\(\s*[|&]\s*\(\s*(uid|cn|objectclass|samaccountname)\s*=\s*\*"),
    // ── prompt injection ────────────────────────────────────────────────
    spec("prompt-ignore-1", PromptInjection, Critical, 0.95, "Instruction override attempt",
         r"(?i)\b(ignore|disregard|forget)\s+(all\s+)?(previous|above|prior)\s+(instructions?|commands?|directives?)"),
    spec("prompt-system-1", PromptInjection, High, 0.90, "System prompt injection",
         r"(?i)\[system\]|<\|?system\|?>"),
    spec("prompt-roleplay-1", PromptInjection, High, 0.85, "Role assumption attempt",
         r"(?i)\b(you are now|act as|pretend to be|roleplay as)\s+(an?\s+)?(admin|administrator|root|superuser)\b"),
    spec("prompt-reveal-1", PromptInjection, Medium, 0.80, "Prompt extraction attempt",
         r"(?i)\b(show|reveal|display|print)\s+(me\s+)?(your|the)\s+(system\s+prompt|hidden\s+instructions?|initial\s+prompt)"),
    // ── credentials ─────────────────────────────────────────────────────
    spec("cred-aws-1", CredentialExposure, Critical, 0.95, "AWS access key id",
         r"\bAKIA[0-9A-Z]{16}\b"),
    spec("cred-private-key-1", CredentialExposure, Critical, 0.99, "PEM private key",
         r"-----BEGIN ([A-Z]+ )?PRIVATE KEY-----"),
    spec("cred-github-1", CredentialExposure, High, 0.90, "GitHub token",
         r"\bgh[pousr]_[A-Za-z0-9]{36}\b"),
    spec("cred-api-key-1", CredentialExposure, High, 0.80, "API key assignment",
         r#"(?i)\b(api[_-]?key|secret[_-]?key|access[_-]?token)["']?\s*[:=]\s*["']?[A-Za-z0-9_\-]{20,}"#),
];

/// Compiled catalog, shared read-only.
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    patterns: Vec<Arc<AttackPattern>>,
}

impl PatternRegistry {
    /// Compile the built-in catalog.
    pub fn builtin() -> Result<Self, BuildError> {
        Self::compile(BUILTIN)
    }

    pub fn compile(specs: &[PatternSpec]) -> Result<Self, BuildError> {
        let patterns = specs
            .iter()
            .map(|s| {
                let matcher = Regex::new(s.expr)
                    .map_err(|source| BuildError::Pattern { id: s.id.into(), source })?;
                Ok(Arc::new(AttackPattern {
                    id: s.id.into(),
                    category: s.category,
                    severity: s.severity,
                    confidence: s.confidence,
                    description: s.description.into(),
                    matcher,
                }))
            })
            .collect::<Result<Vec<_>, BuildError>>()?;
        tap_log!(Level::Debug, "patterns", "compiled {} attack patterns", patterns.len());
        Ok(Self { patterns })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AttackPattern>> {
        self.patterns.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<AttackPattern>> {
        self.patterns.iter().find(|p| p.id == id)
    }

    pub fn by_category(&self, category: Category) -> impl Iterator<Item = &Arc<AttackPattern>> {
        self.patterns.iter().filter(move |p| p.category == category)
    }

    /// Every pattern that matches `data`, in catalog order.
    pub fn match_all(&self, data: &[u8]) -> Vec<&AttackPattern> {
        self.patterns
            .iter()
            .filter(|p| p.matcher.is_match(data))
            .map(|p| p.as_ref())
            .collect()
    }
}
