// src/governor/adaptive.rs

//! Soft, statistical health gate placed in front of one filter.
//!
//! Every evaluation feeds `on_result` with its outcome and latency. The
//! governor keeps an exponentially smoothed latency baseline; an observation
//! slower than three times that baseline (or an outright error) counts as an
//! error. Health drifts toward `1 - error_rate` with the same smoothing
//! factor, and `should_process` only says no while health is low *and* the
//! last healthy observation is still inside the recovery cooldown.

use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Observations slower than this multiple of the baseline count as errors.
const ANOMALY_FACTOR: f64 = 3.0;

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub health_threshold: f64,
    pub error_window:     Duration,
    pub recovery_delay:   Duration,
    /// Smoothing factor for both the latency baseline and health.
    pub smoothing:        f64,
    /// Throughput assumed when fewer observations than this were seen.
    pub baseline_rps:     f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            health_threshold: 0.95,
            error_window: Duration::from_secs(60),
            recovery_delay: Duration::from_secs(5),
            smoothing: 0.1,
            baseline_rps: 100.0,
        }
    }
}

/// Point-in-time view, used by status reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GovernorSnapshot {
    pub health:           f64,
    /// `should_process` currently answers no.
    pub shedding:         bool,
    pub baseline_latency: Option<Duration>,
    pub window_errors:    u64,
    pub window_total:     u64,
}

/// One-second bucket of the sliding window.
#[derive(Debug)]
struct Bucket {
    started: Instant,
    total:   u64,
    errors:  u64,
}

#[derive(Debug)]
struct State {
    health:       f64,
    baseline:     Option<f64>,
    buckets:      VecDeque<Bucket>,
    last_healthy: Instant,
}

impl State {
    fn record(&mut self, now: Instant, is_error: bool) {
        let fresh = match self.buckets.back() {
            Some(b) => now.duration_since(b.started) >= Duration::from_secs(1),
            None => true,
        };
        if fresh {
            self.buckets.push_back(Bucket { started: now, total: 0, errors: 0 });
        }
        if let Some(b) = self.buckets.back_mut() {
            b.total += 1;
            if is_error {
                b.errors += 1;
            }
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.buckets.front() {
            if now.duration_since(front.started) > window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn totals(&self) -> (u64, u64) {
        self.buckets
            .iter()
            .fold((0, 0), |(t, e), b| (t + b.total, e + b.errors))
    }
}

#[derive(Debug)]
pub struct AdaptiveGovernor {
    cfg:   GovernorConfig,
    state: Mutex<State>,
}

impl AdaptiveGovernor {
    pub fn new(cfg: GovernorConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State {
                health: 1.0,
                baseline: None,
                buckets: VecDeque::new(),
                last_healthy: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shedding(&self, s: &State) -> bool {
        s.health < self.cfg.health_threshold && s.last_healthy.elapsed() < self.cfg.recovery_delay
    }

    /// `false` only while unhealthy and still within the recovery cooldown.
    pub fn should_process(&self) -> bool {
        let s = self.lock();
        !self.shedding(&s)
    }

    /// Feed one evaluation outcome.
    pub fn on_result<T, E>(&self, result: &Result<T, E>, latency: Duration) {
        let now = Instant::now();
        let alpha = self.cfg.smoothing;
        let lat = latency.as_secs_f64();
        let mut s = self.lock();

        // compare against the baseline before absorbing this sample
        let anomalous = matches!(s.baseline, Some(b) if b > 0.0 && lat > ANOMALY_FACTOR * b);
        s.baseline = Some(match s.baseline {
            Some(b) => alpha * lat + (1.0 - alpha) * b,
            None => lat,
        });

        let is_error = anomalous || result.is_err();
        s.record(now, is_error);
        if !is_error {
            s.last_healthy = now;
        }
        s.prune(now, self.cfg.error_window);

        let (total, errors) = s.totals();
        let assumed = self.cfg.baseline_rps * self.cfg.error_window.as_secs_f64();
        let expected = (total as f64).max(assumed).max(1.0);
        let error_rate = (errors as f64 / expected).min(1.0);
        s.health = s.health * (1.0 - alpha) + (1.0 - error_rate) * alpha;
    }

    pub fn health(&self) -> f64 {
        self.lock().health
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let s = self.lock();
        let (total, errors) = s.totals();
        GovernorSnapshot {
            health: s.health,
            shedding: self.shedding(&s),
            baseline_latency: s.baseline.map(Duration::from_secs_f64),
            window_errors: errors,
            window_total: total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(recovery: Duration) -> GovernorConfig {
        GovernorConfig {
            health_threshold: 0.95,
            error_window: Duration::from_secs(60),
            recovery_delay: recovery,
            smoothing: 0.5,
            baseline_rps: 1.0,
        }
    }

    const OK: Result<(), ()> = Ok(());
    const FAIL: Result<(), ()> = Err(());

    #[test]
    fn healthy_governor_processes() {
        let g = AdaptiveGovernor::new(cfg(Duration::from_secs(5)));
        for _ in 0..10 {
            g.on_result(&OK, Duration::from_millis(1));
        }
        assert!(g.should_process());
        assert!(g.health() > 0.99);
    }

    #[test]
    fn errors_inside_cooldown_throttle() {
        let g = AdaptiveGovernor::new(cfg(Duration::from_secs(5)));
        g.on_result(&OK, Duration::from_millis(1));
        for _ in 0..40 {
            g.on_result(&FAIL, Duration::from_millis(1));
        }
        assert!(g.health() < 0.95, "health {}", g.health());
        assert!(!g.should_process());
    }

    #[test]
    fn unhealthy_outside_cooldown_still_probes() {
        let g = AdaptiveGovernor::new(cfg(Duration::ZERO));
        for _ in 0..40 {
            g.on_result(&FAIL, Duration::from_millis(1));
        }
        assert!(g.health() < 0.95);
        assert!(g.should_process());
    }

    #[test]
    fn slow_sample_counts_as_error() {
        let g = AdaptiveGovernor::new(cfg(Duration::from_secs(5)));
        g.on_result(&OK, Duration::from_millis(1));
        g.on_result(&OK, Duration::from_millis(1));
        g.on_result(&OK, Duration::from_millis(10));

        let snap = g.snapshot();
        assert_eq!(snap.window_total, 3);
        assert_eq!(snap.window_errors, 1);
        assert!(snap.baseline_latency.unwrap() > Duration::from_millis(1));
    }

    #[test]
    fn snapshot_reports_shedding() {
        let g = AdaptiveGovernor::new(cfg(Duration::from_secs(5)));
        g.on_result(&OK, Duration::from_millis(1));
        assert!(!g.snapshot().shedding);
        for _ in 0..40 {
            g.on_result(&FAIL, Duration::from_millis(1));
        }
        let snap = g.snapshot();
        assert!(snap.shedding);
        assert_eq!(snap.shedding, !g.should_process());
        assert_eq!(snap.window_errors, 40);
    }
}
