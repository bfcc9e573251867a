// src/capture/strace.rs

//! Capture through an `strace` child attached with ptrace.
//!
//! strace writes one line per syscall to stderr. With `-f` several tasks can
//! interleave, so a call may be split into `<unfinished ...>` and
//! `<... read resumed>` halves; the parser stitches those back per task id.
//! Events always carry the attached pid; the calling thread goes in `tid`.

use async_trait::async_trait;
use regex::Regex;
use shared::{
    constants::{fd_label, is_stdio},
    Direction, StreamEvent,
};
use std::{collections::HashMap, path::PathBuf, process::Stdio, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    process::{Child, ChildStderr, Command},
    sync::{mpsc, oneshot},
    time::timeout,
};

use super::{CaptureConfig, CaptureError, CaptureSession, Capturer, Process, SESSION_CAPACITY};
use crate::tap_log;

const TRACED: &str = "read,write,readv,writev,recvfrom,sendto,recvmsg,sendmsg";

pub struct StraceCapturer {
    program:      String,
    string_limit: usize,
    attach_grace: Duration,
    stdio_only:   bool,
    proc_root:    PathBuf,
    grammar:      Arc<Grammar>,
}

impl StraceCapturer {
    pub fn new(cfg: &CaptureConfig) -> Result<Self, CaptureError> {
        let grammar = Grammar::new().map_err(|e| CaptureError::Backend {
            pid: 0,
            detail: format!("syscall grammar: {e}"),
        })?;
        Ok(Self {
            program: cfg.strace_path.clone(),
            string_limit: cfg.string_limit,
            attach_grace: cfg.attach_grace,
            stdio_only: cfg.stdio_only,
            proc_root: PathBuf::from("/proc"),
            grammar: Arc::new(grammar),
        })
    }

    /// Look for live pids under another procfs mount.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn args(&self, pid: u32) -> Vec<String> {
        vec![
            "-p".into(),
            pid.to_string(),
            "-f".into(),
            "-qq".into(),
            "-s".into(),
            self.string_limit.to_string(),
            "-xx".into(),
            "-e".into(),
            format!("trace={TRACED}"),
        ]
    }
}

#[async_trait]
impl Capturer for StraceCapturer {
    fn name(&self) -> &'static str {
        "strace"
    }

    async fn attach(&self, target: &Process) -> Result<CaptureSession, CaptureError> {
        let pid = target.pid;
        if !self.proc_root.join(pid.to_string()).exists() {
            return Err(CaptureError::ProcessVanished(pid));
        }

        let mut child = Command::new(&self.program)
            .args(self.args(pid))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn { program: self.program.clone(), source })?;

        let stderr = child.stderr.take().ok_or_else(|| CaptureError::Backend {
            pid,
            detail: "stderr was not captured".into(),
        })?;
        let mut lines = BufReader::new(stderr).lines();

        // An attach that is going to fail does so straight away.
        if let Ok(status) = timeout(self.attach_grace, child.wait()).await {
            let mut detail = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if !detail.is_empty() {
                    detail.push_str("; ");
                }
                detail.push_str(line.trim());
            }
            if let Ok(status) = status {
                detail = format!("{detail} ({status})");
            }
            return Err(classify_attach_failure(pid, detail));
        }

        tap_log!(log::Level::Info, "capture", "strace attached to pid {} ({})", pid, target.name);

        let parser = StraceParser::new(pid, target.name.clone(), self.stdio_only, self.grammar.clone());
        let (tx, rx) = mpsc::channel(SESSION_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(pump(child, lines, parser, tx, stop_rx));
        Ok(CaptureSession::new(pid, rx, stop_tx, task))
    }
}

fn classify_attach_failure(pid: u32, detail: String) -> CaptureError {
    if detail.contains("Operation not permitted") {
        CaptureError::PermissionDenied { pid, detail }
    } else if detail.contains("No such process") {
        CaptureError::ProcessVanished(pid)
    } else {
        CaptureError::Backend { pid, detail }
    }
}

async fn pump(
    mut child: Child,
    mut lines: Lines<BufReader<ChildStderr>>,
    mut parser: StraceParser,
    tx: mpsc::Sender<StreamEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let pid = parser.pid;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(ev) = parser.feed(&line) {
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    tap_log!(log::Level::Info, "capture", "strace for pid {} finished", pid);
                    break;
                }
                Err(e) => {
                    tap_log!(log::Level::Warn, "capture", "reading strace output for pid {}: {}", pid, e);
                    break;
                }
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/*──────────────────────────────── parsing ────────────────────────────────*/

pub(crate) struct Grammar {
    call:    Regex,
    resumed: Regex,
    quoted:  Regex,
    iov:     Regex,
    result:  Regex,
}

impl Grammar {
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            call: Regex::new(
                r"^(?:\[pid\s+(\d+)\]\s+)?(read|write|readv|writev|recvfrom|sendto|recvmsg|sendmsg)\((\d+),\s*(.*)$",
            )?,
            resumed: Regex::new(r"^(?:\[pid\s+(\d+)\]\s+)?<\.\.\.\s+(\w+)\s+resumed>\s*(.*)$")?,
            quoted: Regex::new(r#""((?:[^"\\]|\\.)*)""#)?,
            iov: Regex::new(r#"iov_base="((?:[^"\\]|\\.)*)""#)?,
            result: Regex::new(r"\)\s*=\s*(-?\d+)(?:\s.*)?$")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Read,
    Write,
    Readv,
    Writev,
    Recvfrom,
    Sendto,
    Recvmsg,
    Sendmsg,
}

impl Call {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "read" => Call::Read,
            "write" => Call::Write,
            "readv" => Call::Readv,
            "writev" => Call::Writev,
            "recvfrom" => Call::Recvfrom,
            "sendto" => Call::Sendto,
            "recvmsg" => Call::Recvmsg,
            "sendmsg" => Call::Sendmsg,
            _ => return None,
        })
    }

    fn direction(self) -> Direction {
        match self {
            Call::Read | Call::Readv | Call::Recvfrom | Call::Recvmsg => Direction::Inbound,
            Call::Write | Call::Writev | Call::Sendto | Call::Sendmsg => Direction::Outbound,
        }
    }

    fn vectored(self) -> bool {
        matches!(self, Call::Readv | Call::Writev | Call::Recvmsg | Call::Sendmsg)
    }
}

/// Turns strace lines into events for one traced process tree.
pub struct StraceParser {
    pid:        u32,
    name:       String,
    stdio_only: bool,
    grammar:    Arc<Grammar>,
    pending:    HashMap<u32, (Call, i32)>,
}

impl StraceParser {
    pub(crate) fn new(pid: u32, name: String, stdio_only: bool, grammar: Arc<Grammar>) -> Self {
        Self { pid, name, stdio_only, grammar, pending: HashMap::new() }
    }

    /// Standalone parser, used when replaying saved strace output.
    pub fn standalone(pid: u32, name: impl Into<String>, stdio_only: bool) -> Result<Self, regex::Error> {
        Ok(Self::new(pid, name.into(), stdio_only, Arc::new(Grammar::new()?)))
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn feed(&mut self, line: &str) -> Option<StreamEvent> {
        let line = line.trim_end();

        if let Some(c) = self.grammar.call.captures(line) {
            let task = c.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(self.pid);
            let call = Call::parse(&c[2])?;
            let fd: i32 = c[3].parse().ok()?;
            let rest = c.get(4).map_or("", |m| m.as_str());
            if rest.ends_with("<unfinished ...>") {
                self.pending.insert(task, (call, fd));
                return None;
            }
            return self.complete(task, call, fd, rest);
        }

        if let Some(c) = self.grammar.resumed.captures(line) {
            let task = c.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(self.pid);
            let (call, fd) = self.pending.remove(&task)?;
            if Call::parse(&c[2]) != Some(call) {
                tap_log!(log::Level::Debug, "capture", "mismatched resume for task {}: {}", task, line);
                return None;
            }
            let rest = c.get(3).map_or("", |m| m.as_str());
            return self.complete(task, call, fd, rest);
        }

        None
    }

    fn complete(&self, task: u32, call: Call, fd: i32, rest: &str) -> Option<StreamEvent> {
        if self.stdio_only && !is_stdio(fd) {
            return None;
        }
        let result = self.grammar.result.captures(rest)?;
        let n: i64 = result[1].parse().ok()?;
        if n <= 0 {
            return None;
        }
        let args = &rest[..result.get(0).map_or(rest.len(), |m| m.start())];

        let data: Vec<u8> = if call.vectored() {
            self.grammar.iov.captures_iter(args).flat_map(|c| unescape(&c[1])).collect()
        } else {
            self.grammar.quoted.captures(args).map(|c| unescape(&c[1]))?
        };
        if data.is_empty() {
            return None;
        }

        let captured = data.len();
        let mut ev = StreamEvent::new(call.direction(), self.pid, self.name.clone(), fd, data).with_tid(task);
        let reported = usize::try_from(n).unwrap_or(captured);
        if reported > captured {
            ev.size = reported;
            let verb = if call.direction() == Direction::Inbound { "read" } else { "write" };
            ev.summary = format!("{verb} {reported} bytes on {} ({captured} captured)", fd_label(fd));
        }
        Some(ev)
    }
}

/// Decode strace's C-style escapes (`-xx` emits `\xHH` for every byte).
pub fn unescape(s: &str) -> Vec<u8> {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len() / 4 + 1);
    let mut i = 0;
    while i < b.len() {
        if b[i] != b'\\' || i + 1 >= b.len() {
            out.push(b[i]);
            i += 1;
            continue;
        }
        let esc = b[i + 1];
        i += 2;
        match esc {
            b'x' => {
                let end = (i + 2).min(b.len());
                let hex = std::str::from_utf8(&b[i..end]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(v) if end - i == 2 => {
                        out.push(v);
                        i = end;
                    }
                    _ => out.extend_from_slice(b"\\x"),
                }
            }
            b'0'..=b'7' => {
                let mut v = u32::from(esc - b'0');
                let mut taken = 0;
                while taken < 2 && i < b.len() && (b'0'..=b'7').contains(&b[i]) {
                    v = v * 8 + u32::from(b[i] - b'0');
                    i += 1;
                    taken += 1;
                }
                out.push((v & 0xff) as u8);
            }
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'f' => out.push(0x0c),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> StraceParser {
        StraceParser::standalone(100, "srv", true).unwrap()
    }

    #[test]
    fn plain_write_is_outbound() {
        let ev = parser().feed(r#"write(1, "\x68\x69\x0a", 3) = 3"#).unwrap();
        assert_eq!(ev.direction, Direction::Outbound);
        assert_eq!(ev.fd, 1);
        assert_eq!(ev.pid, 100);
        assert_eq!(ev.tid, None);
        assert_eq!(ev.data, b"hi\n");
        assert_eq!(ev.summary, "write 3 bytes on stdout");
    }

    #[test]
    fn read_with_task_prefix() {
        let ev = parser().feed(r#"[pid  4242] read(0, "\x7b\x7d", 65535) = 2"#).unwrap();
        assert_eq!(ev.direction, Direction::Inbound);
        assert_eq!(ev.pid, 100);
        assert_eq!(ev.tid, Some(4242));
        assert_eq!(ev.data, b"{}");
    }

    #[test]
    fn unfinished_and_resumed_are_joined() {
        let mut p = parser();
        assert!(p.feed("[pid 7] read(0,  <unfinished ...>").is_none());
        assert!(p.feed(r#"[pid 8] write(2, "\x6f\x6b", 2) = 2"#).is_some());
        assert_eq!(p.pending(), 1);
        let ev = p.feed(r#"[pid 7] <... read resumed>"\x61\x62\x63", 65535) = 3"#).unwrap();
        assert_eq!(ev.data, b"abc");
        assert_eq!(ev.fd, 0);
        assert_eq!(p.pending(), 0);
    }

    #[test]
    fn failures_and_noise_are_ignored() {
        let mut p = parser();
        assert!(p.feed(r#"write(1, "\x61", 1) = -1 EPIPE (Broken pipe)"#).is_none());
        assert!(p.feed(r#"read(0, "", 65535) = 0"#).is_none());
        assert!(p.feed("--- SIGCHLD {si_signo=SIGCHLD} ---").is_none());
        assert!(p.feed("+++ exited with 0 +++").is_none());
        assert!(p.feed(r#"write(5, "\x61", 1) = 1"#).is_none(), "non-stdio fd with stdio_only");
    }

    #[test]
    fn vectored_writes_concatenate_buffers() {
        let mut p = StraceParser::standalone(1, "srv", false).unwrap();
        let line = r#"writev(7, [{iov_base="\x61\x62", iov_len=2}, {iov_base="\x63", iov_len=1}], 2) = 3"#;
        assert_eq!(p.feed(line).unwrap().data, b"abc");
    }

    #[test]
    fn truncated_payload_keeps_reported_size() {
        let ev = parser().feed(r#"read(0, "\x61\x62"..., 65535) = 9000"#).unwrap();
        assert_eq!(ev.data, b"ab");
        assert_eq!(ev.size, 9000);
        assert!(ev.summary.starts_with("read 9000 bytes on stdin"));
    }

    #[test]
    fn unescape_handles_c_escapes() {
        assert_eq!(unescape(r#"\x41\n\t\\\"\101\0"#), b"A\n\t\\\"A\0");
        assert_eq!(unescape("plain"), b"plain");
        assert_eq!(unescape(r"\xZZ"), b"\\xZZ");
    }

    #[test]
    fn args_request_hex_and_stdio_calls() {
        let cap = StraceCapturer::new(&CaptureConfig::default()).unwrap();
        let args = cap.args(55);
        assert_eq!(&args[..2], &["-p".to_string(), "55".to_string()]);
        assert!(args.contains(&"-xx".to_string()));
        assert!(args.iter().any(|a| a.starts_with("trace=read,write")));
    }

    #[tokio::test]
    async fn missing_target_is_reported_as_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let cap = StraceCapturer::new(&CaptureConfig::default()).unwrap().with_proc_root(dir.path());
        let err = cap.attach(&Process::new(31337, 1, "gone", "gone")).await.err().unwrap();
        assert!(matches!(err, CaptureError::ProcessVanished(31337)));
    }

    #[test]
    fn attach_failures_are_classified() {
        let e = classify_attach_failure(3, "strace: attach: ptrace(PTRACE_SEIZE, 3): Operation not permitted".into());
        assert!(matches!(e, CaptureError::PermissionDenied { pid: 3, .. }));
        assert!(matches!(classify_attach_failure(3, "No such process".into()), CaptureError::ProcessVanished(3)));
        assert!(matches!(classify_attach_failure(3, "boom".into()), CaptureError::Backend { .. }));
    }
}
