// src/capture/process.rs

//! Process enumeration and target matching.

use log::Level;
use regex::{Regex, RegexBuilder};
use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::tap_log;

/// Name patterns watched when the config does not say otherwise.
pub fn default_patterns() -> Vec<String> {
    [
        "claude*",
        "*mcp-server*",
        "*mcp_server*",
        "node*mcp*",
        "python*mcp*",
        "deno*mcp*",
        "*server.py",
        "*.claude-mcp-servers*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    McpServer,
    AssistantClient,
    Other,
}

impl ProcessKind {
    pub fn classify(name: &str, cmdline: &str) -> Self {
        let name = name.to_ascii_lowercase();
        let cmd = cmdline.to_ascii_lowercase();
        if name.contains("mcp") || cmd.contains("mcp") {
            ProcessKind::McpServer
        } else if name.contains("claude") || cmd.contains("claude") {
            ProcessKind::AssistantClient
        } else {
            ProcessKind::Other
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessKind::McpServer => "mcp-server",
            ProcessKind::AssistantClient => "assistant-client",
            ProcessKind::Other => "other",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid:     u32,
    pub ppid:    u32,
    pub name:    String,
    pub cmdline: String,
    pub exe:     Option<PathBuf>,
    pub kind:    ProcessKind,
}

impl Process {
    pub fn new(pid: u32, ppid: u32, name: impl Into<String>, cmdline: impl Into<String>) -> Self {
        let name = name.into();
        let cmdline = cmdline.into();
        let kind = ProcessKind::classify(&name, &cmdline);
        Self { pid, ppid, name, cmdline, exe: None, kind }
    }

    pub fn is_target(&self) -> bool {
        self.kind != ProcessKind::Other
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot enumerate processes: {0}")]
    List(#[source] io::Error),

    #[error("invalid process pattern '{pattern}': {source}")]
    Pattern { pattern: String, #[source] source: regex::Error },
}

/// Where process facts come from. `/proc` in production, a table in tests.
pub trait ProcessSource: Send + Sync {
    fn list_pids(&self) -> io::Result<Vec<u32>>;

    fn read_process(&self, pid: u32) -> io::Result<Process>;

    fn children_of(&self, pid: u32) -> io::Result<Vec<u32>> {
        let mut kids: Vec<u32> = self
            .list_pids()?
            .into_iter()
            .filter_map(|p| self.read_process(p).ok())
            .filter(|p| p.ppid == pid)
            .map(|p| p.pid)
            .collect();
        kids.sort_unstable();
        Ok(kids)
    }
}

/*──────────────────────────────── /proc ────────────────────────────────*/

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn parent_of(&self, pid: u32) -> u32 {
        fs::read_to_string(self.root.join(pid.to_string()).join("status"))
            .ok()
            .and_then(|status| {
                status
                    .lines()
                    .find_map(|l| l.strip_prefix("PPid:"))
                    .and_then(|v| v.trim().parse().ok())
            })
            .unwrap_or(0)
    }
}

impl ProcessSource for ProcFs {
    fn list_pids(&self) -> io::Result<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn read_process(&self, pid: u32) -> io::Result<Process> {
        let dir = self.root.join(pid.to_string());

        let raw = fs::read(dir.join("cmdline"))?;
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ").trim().to_string();
        if cmdline.is_empty() {
            // kernel threads and zombies
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty cmdline"));
        }

        let name = fs::read_to_string(dir.join("comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let mut p = Process::new(pid, self.parent_of(pid), name, cmdline);
        p.exe = fs::read_link(dir.join("exe")).ok();
        Ok(p)
    }
}

/*──────────────────────────────── fixed table ────────────────────────────────*/

/// In-memory process table.
#[derive(Debug, Default, Clone)]
pub struct StaticProcessSource {
    procs: HashMap<u32, Process>,
}

impl StaticProcessSource {
    pub fn new(procs: impl IntoIterator<Item = Process>) -> Self {
        Self { procs: procs.into_iter().map(|p| (p.pid, p)).collect() }
    }

    pub fn insert(&mut self, p: Process) {
        self.procs.insert(p.pid, p);
    }
}

impl ProcessSource for StaticProcessSource {
    fn list_pids(&self) -> io::Result<Vec<u32>> {
        let mut pids: Vec<u32> = self.procs.keys().copied().collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn read_process(&self, pid: u32) -> io::Result<Process> {
        self.procs
            .get(&pid)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no process {pid}")))
    }
}

/*──────────────────────────────── matching ────────────────────────────────*/

struct Rule {
    glob:   Regex,
    needle: String,
}

/// Compiled discovery patterns. A process matches when any glob matches its
/// name or command line, or when the pattern minus its `*` wildcards appears
/// inside either. Case is ignored throughout.
pub struct ProcessMatcher {
    rules: Vec<Rule>,
}

impl ProcessMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, DiscoveryError> {
        let mut rules = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = RegexBuilder::new(&glob_to_regex(pattern))
                .case_insensitive(true)
                .build()
                .map_err(|source| DiscoveryError::Pattern { pattern: pattern.into(), source })?;
            rules.push(Rule { glob, needle: pattern.trim_matches('*').to_ascii_lowercase() });
        }
        Ok(Self { rules })
    }

    pub fn matches(&self, p: &Process) -> bool {
        let name = p.name.to_ascii_lowercase();
        let cmd = p.cmdline.to_ascii_lowercase();
        self.rules.iter().any(|r| {
            r.glob.is_match(&p.name)
                || r.glob.is_match(&p.cmdline)
                || (!r.needle.is_empty()
                    && !r.needle.contains('*')
                    && (name.contains(&r.needle) || cmd.contains(&r.needle)))
        })
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut re = String::with_capacity(glob.len() + 8);
    re.push('^');
    for c in glob.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    re.push('$');
    re
}

/// Processes from `source` matching the discovery patterns, own pid excluded.
/// Entries that vanish or cannot be read mid-scan are skipped.
pub fn discover_processes(
    source: &dyn ProcessSource,
    matcher: &ProcessMatcher,
) -> Result<Vec<Process>, DiscoveryError> {
    let me = std::process::id();
    let found = source
        .list_pids()
        .map_err(DiscoveryError::List)?
        .into_iter()
        .filter(|&pid| pid != me)
        .filter_map(|pid| match source.read_process(pid) {
            Ok(p) => Some(p),
            Err(e) => {
                tap_log!(Level::Trace, "discovery", "skipping pid {}: {}", pid, e);
                None
            }
        })
        .filter(|p| matcher.matches(p))
        .collect();
    Ok(found)
}
