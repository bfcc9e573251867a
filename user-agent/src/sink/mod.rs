//! Sink abstraction: where captured events and alerts end up.
//! -----------------------------------------------------------------------------
//! The core only depends on the three-call [`Sink`] contract. Two concrete
//! sinks ship with the agent: an in-memory collector and a JSON-lines writer
//! for stdout or a file.

pub mod jsonl;
pub mod memory;

use async_trait::async_trait;
use shared::{SecurityAlert, StreamEvent};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;

pub use jsonl::JsonLinesSink;
pub use memory::MemorySink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink is closed")]
    Closed,

    #[error("unsupported destination '{0}'")]
    Destination(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Sink: Send + Sync + 'static {
    async fn write_event(&self, event: &StreamEvent) -> Result<(), SinkError>;
    async fn write_alert(&self, alert: &SecurityAlert) -> Result<(), SinkError>;
    async fn close(&self) -> Result<(), SinkError>;
}

/// Parsed `[output].destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

impl std::str::FromStr for Destination {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "-" | "stdout" => Ok(Destination::Stdout),
            other => match other.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(Destination::File(PathBuf::from(path))),
                _ => Err(SinkError::Destination(other.into())),
            },
        }
    }
}

/// Open the sink named by a destination string.
pub async fn open(destination: &str) -> Result<Arc<dyn Sink>, SinkError> {
    let sink: Arc<dyn Sink> = match destination.parse()? {
        Destination::Stdout => Arc::new(JsonLinesSink::stdout()),
        Destination::File(path) => Arc::new(JsonLinesSink::create(&path).await?),
    };
    Ok(sink)
}
