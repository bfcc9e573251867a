// src/sink/jsonl.rs

//! One JSON object per line, tagged with `"kind"`.

use async_trait::async_trait;
use log::Level;
use serde::Serialize;
use shared::{SecurityAlert, StreamEvent};
use std::path::Path;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use super::{Sink, SinkError};
use crate::tap_log;

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Line<'a> {
    Event(&'a StreamEvent),
    Alert(&'a SecurityAlert),
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct JsonLinesSink {
    out: Mutex<Option<Writer>>,
}

impl JsonLinesSink {
    pub fn new<W: AsyncWrite + Send + Unpin + 'static>(w: W) -> Self {
        Self { out: Mutex::new(Some(Box::new(w))) }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Append to `path`, creating it if needed.
    pub async fn create(path: &Path) -> Result<Self, SinkError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        tap_log!(Level::Info, "sink", "writing JSON lines to {}", path.display());
        Ok(Self::new(file))
    }

    async fn write_line(&self, line: Line<'_>) -> Result<(), SinkError> {
        let mut buf = serde_json::to_vec(&line)?;
        buf.push(b'\n');
        let mut guard = self.out.lock().await;
        let w = guard.as_mut().ok_or(SinkError::Closed)?;
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    async fn write_event(&self, event: &StreamEvent) -> Result<(), SinkError> {
        self.write_line(Line::Event(event)).await
    }

    async fn write_alert(&self, alert: &SecurityAlert) -> Result<(), SinkError> {
        self.write_line(Line::Alert(alert)).await
    }

    async fn close(&self) -> Result<(), SinkError> {
        if let Some(mut w) = self.out.lock().await.take() {
            w.shutdown().await?;
        }
        Ok(())
    }
}
