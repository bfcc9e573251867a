// src/governor/breaker.rs

//! Hard, binary fail-fast gate around one dependency.
//!
//! Closed ─(max_failures consecutive failures)→ Open ─(reset_timeout)→
//! HalfOpen ─(half_open_limit successes)→ Closed. Any failure while HalfOpen
//! re-opens. A rejection while Open never invokes the dependency and never
//! counts as a failure.

use std::{
    fmt,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use log::Level;
use thiserror::Error;

use crate::tap_log;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub max_failures:    u32,
    pub reset_timeout:   Duration,
    pub half_open_limit: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { max_failures: 5, reset_timeout: Duration::from_secs(30), half_open_limit: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without calling the dependency.
    #[error("circuit breaker '{0}' is open")]
    Open(String),
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSnapshot {
    pub state:                BreakerState,
    pub consecutive_failures: u32,
    pub open_for:             Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state:     BreakerState,
    failures:  u32,
    opened_at: Option<Instant>,
    successes: u32,
    in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name:  String,
    cfg:   BreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission ticket for one call. Dropping it without an outcome (the caller
/// was cancelled) releases a half-open probe slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe:   bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            let mut g = self.breaker.lock();
            g.in_flight = g.in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                successes: 0,
                in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, promoting Open → HalfOpen if the timeout has passed.
    pub fn state(&self) -> BreakerState {
        let mut g = self.lock();
        self.maybe_half_open(&mut g);
        g.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut g = self.lock();
        self.maybe_half_open(&mut g);
        BreakerSnapshot {
            state: g.state,
            consecutive_failures: g.failures,
            open_for: g.opened_at.filter(|_| g.state == BreakerState::Open).map(|t| t.elapsed()),
        }
    }

    /// Run `f` under the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = self.admit().map_err(|()| BreakerError::Open(self.name.clone()))?;
        let out = f().await;
        permit.settled = true;
        match &out {
            Ok(_) => self.on_success(permit.probe),
            Err(_) => self.on_failure(permit.probe),
        }
        out.map_err(BreakerError::Inner)
    }

    /*──────────────────────── private helpers ─────────────────────────*/

    fn maybe_half_open(&self, g: &mut Inner) {
        if g.state == BreakerState::Open
            && g.opened_at.is_some_and(|t| t.elapsed() >= self.cfg.reset_timeout)
        {
            self.transition(g, BreakerState::HalfOpen);
            g.successes = 0;
            g.in_flight = 0;
        }
    }

    fn admit(&self) -> Result<Permit<'_>, ()> {
        let mut g = self.lock();
        self.maybe_half_open(&mut g);
        match g.state {
            BreakerState::Closed => Ok(Permit { breaker: self, probe: false, settled: false }),
            BreakerState::Open => {
                metrics::counter!("breaker_rejections_total", "breaker" => self.name.clone())
                    .increment(1);
                Err(())
            }
            BreakerState::HalfOpen => {
                if g.in_flight >= self.cfg.half_open_limit.max(1) {
                    return Err(());
                }
                g.in_flight += 1;
                Ok(Permit { breaker: self, probe: true, settled: false })
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut g = self.lock();
        match g.state {
            BreakerState::Closed => g.failures = 0,
            BreakerState::HalfOpen if probe => {
                g.in_flight = g.in_flight.saturating_sub(1);
                g.successes += 1;
                if g.successes >= self.cfg.half_open_limit {
                    self.transition(&mut g, BreakerState::Closed);
                    g.failures = 0;
                    g.opened_at = None;
                }
            }
            // a call admitted before the breaker tripped; its outcome is stale
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut g = self.lock();
        match g.state {
            BreakerState::Closed => {
                g.failures += 1;
                if g.failures >= self.cfg.max_failures {
                    self.transition(&mut g, BreakerState::Open);
                    g.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen if probe => {
                g.failures += 1;
                self.transition(&mut g, BreakerState::Open);
                g.opened_at = Some(Instant::now());
                g.in_flight = 0;
            }
            _ => {}
        }
    }

    fn transition(&self, g: &mut Inner, to: BreakerState) {
        if g.state == to {
            return;
        }
        let level = if to == BreakerState::Open { Level::Warn } else { Level::Info };
        tap_log!(level, "breaker", "breaker '{}' {} -> {}", self.name, g.state, to);
        metrics::counter!(
            "breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.to_string()
        )
        .increment(1);
        g.state = to;
    }
}
