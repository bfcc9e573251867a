// src/capture/channel.rs

//! Capturer fed from crossbeam channels, one per pid.
//!
//! Producers live on plain threads (replay tools, embedders, tests); the
//! session side is async. A blocking bridge moves events across.

use async_trait::async_trait;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use shared::StreamEvent;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

use super::{CaptureError, CaptureSession, Capturer, Process, SESSION_CAPACITY};
use crate::tap_log;

const POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
pub struct ChannelCapturer {
    feeds: Mutex<HashMap<u32, Receiver<StreamEvent>>>,
}

impl ChannelCapturer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pid` and get the producer half. Dropping every sender ends
    /// the session as if the process had exited.
    pub fn feed(&self, pid: u32) -> Sender<StreamEvent> {
        let (tx, rx) = unbounded();
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner).insert(pid, rx);
        tx
    }
}

#[async_trait]
impl Capturer for ChannelCapturer {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn attach(&self, target: &Process) -> Result<CaptureSession, CaptureError> {
        let pid = target.pid;
        let feed = self
            .feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid)
            .ok_or(CaptureError::ProcessVanished(pid))?;

        let (tx, rx) = mpsc::channel(SESSION_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let bridge = tokio::task::spawn_blocking(move || {
                loop {
                    match feed.recv_timeout(POLL) {
                        Ok(ev) => {
                            if tx.blocking_send(ev).is_err() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) if tx.is_closed() => break,
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });
            // On stop the bridge notices the closed session within one poll.
            tokio::select! {
                _ = stop_rx => {}
                res = bridge => {
                    if let Err(e) = res {
                        tap_log!(log::Level::Warn, "capture", "channel bridge for pid {} failed: {}", pid, e);
                    }
                }
            }
        });

        Ok(CaptureSession::new(pid, rx, stop_tx, task))
    }
}
