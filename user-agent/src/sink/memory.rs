// src/sink/memory.rs

use async_trait::async_trait;
use shared::{SecurityAlert, StreamEvent};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, PoisonError,
};

use super::{Sink, SinkError};

/// Keeps everything in memory. Used by tests and embedders that poll.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StreamEvent>>,
    alerts: Mutex<Vec<SecurityAlert>>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn alerts(&self) -> Vec<SecurityAlert> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), SinkError> {
        if self.is_closed() { Err(SinkError::Closed) } else { Ok(()) }
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write_event(&self, event: &StreamEvent) -> Result<(), SinkError> {
        self.check_open()?;
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
        Ok(())
    }

    async fn write_alert(&self, alert: &SecurityAlert) -> Result<(), SinkError> {
        self.check_open()?;
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).push(alert.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
