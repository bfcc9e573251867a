// src/capture/simulate.rs

//! Synthetic MCP traffic for demos and dry runs without ptrace rights.

use async_trait::async_trait;
use shared::{constants::STDIN_FD, constants::STDOUT_FD, Direction, StreamEvent};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    time::{interval, MissedTickBehavior},
};

use super::{CaptureError, CaptureSession, Capturer, Process, SESSION_CAPACITY};

/// A short JSON-RPC conversation, replayed in a loop. Two of the requests
/// touch sensitive paths so the pipeline has something to report.
const SCRIPT: &[(Direction, &str)] = &[
    (Direction::Inbound, r#"{"jsonrpc":"2.0","method":"tools/list","id":"1"}"#),
    (
        Direction::Outbound,
        r#"{"jsonrpc":"2.0","result":{"tools":[{"name":"read_file","description":"Read file contents"}]},"id":"1"}"#,
    ),
    (
        Direction::Inbound,
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"read_file","arguments":{"path":"/etc/passwd"}},"id":"2"}"#,
    ),
    (
        Direction::Outbound,
        r#"{"jsonrpc":"2.0","result":{"content":"root:x:0:0:root:/root:/bin/bash\n..."},"id":"2"}"#,
    ),
    (
        Direction::Inbound,
        r#"{"jsonrpc":"2.0","method":"execute","params":{"command":"cat /home/user/.ssh/id_rsa"},"id":"3"}"#,
    ),
];

pub struct SimulatedCapturer {
    interval: Duration,
}

impl SimulatedCapturer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Event number `n` of the scripted conversation for `target`.
    pub fn scripted(target: &Process, n: usize) -> StreamEvent {
        let (direction, body) = SCRIPT[n % SCRIPT.len()];
        let fd = match direction {
            Direction::Inbound => STDIN_FD,
            Direction::Outbound => STDOUT_FD,
        };
        let mut data = body.as_bytes().to_vec();
        data.push(b'\n');
        StreamEvent::new(direction, target.pid, target.name.clone(), fd, data)
    }
}

#[async_trait]
impl Capturer for SimulatedCapturer {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn attach(&self, target: &Process) -> Result<CaptureSession, CaptureError> {
        let (tx, rx) = mpsc::channel(SESSION_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let pid = target.pid;
        let target = target.clone();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let task = tokio::spawn(async move {
            for n in 0.. {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if tx.send(Self::scripted(&target, n)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(CaptureSession::new(pid, rx, stop_tx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_the_script_until_detached() {
        let cap = SimulatedCapturer::new(Duration::from_millis(5));
        let target = Process::new(12, 1, "mcp-server", "mcp-server --stdio");
        let mut session = cap.attach(&target).await.unwrap();

        let first = session.next().await.unwrap();
        assert_eq!(first.direction, Direction::Inbound);
        assert_eq!(first.fd, STDIN_FD);
        assert!(first.text().contains("tools/list"));

        let second = session.next().await.unwrap();
        assert_eq!(second.direction, Direction::Outbound);
        assert_eq!(second.pid, 12);

        tokio::time::timeout(Duration::from_secs(1), session.detach()).await.unwrap();
    }

    #[test]
    fn script_wraps_around() {
        let p = Process::new(1, 0, "srv", "srv");
        assert_eq!(SimulatedCapturer::scripted(&p, 0).data, SimulatedCapturer::scripted(&p, SCRIPT.len()).data);
    }
}
