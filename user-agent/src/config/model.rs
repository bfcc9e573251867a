// src/config/model.rs

use serde::Deserialize;
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;

use crate::capture::CaptureConfig;
use crate::coordinator::{CoordinatorConfig, NodeSpec, UnknownStrategy};
use crate::filters::FilterConfig;
use crate::governor::{BreakerConfig, GovernorConfig};

/// Top-level runtime config
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub logging:     LoggingConfig,
    pub capture:     CaptureConfig,
    pub filters:     FilterConfig,
    pub coordinator: CoordinatorConfig,
    pub nodes:       Vec<NodeSpec>,
    pub output:      OutputConfig,
    pub metrics:     MetricsConfig,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]            pub enable: bool,
    #[serde(default)]            pub file:   Option<String>,
    #[serde(default = "default_level")] pub level: String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// Mirror of the `[output]` table
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_destination")] pub destination: String,
}
fn default_destination() -> String { "stdout".into() }

impl Default for OutputConfig {
    fn default() -> Self {
        Self { destination: default_destination() }
    }
}

/// Mirror of the `[metrics]` table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)] pub prometheus_listen: Option<SocketAddr>,
}

/*──────────────────────────── raw TOML stubs ─────────────────────────────*/

/// Whole file as written on disk. Durations are still strings here.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub logging:     LoggingConfig,
    pub capture:     RawCapture,
    pub filters:     RawFilters,
    pub coordinator: RawCoordinator,
    pub nodes:       Vec<NodeSpec>,
    pub output:      OutputConfig,
    pub metrics:     MetricsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RawCapture {
    pub patterns:          Vec<String>,
    pub pids:              Vec<u32>,
    pub strace_path:       String,
    pub string_limit:      usize,
    pub attach_grace:      String,
    pub stdio_only:        bool,
    pub simulate:          bool,
    pub simulate_interval: String,
    pub rescan_interval:   String,
}

impl Default for RawCapture {
    fn default() -> Self {
        let d = CaptureConfig::default();
        Self {
            patterns: d.patterns,
            pids: d.pids,
            strace_path: d.strace_path,
            string_limit: d.string_limit,
            attach_grace: "200ms".into(),
            stdio_only: d.stdio_only,
            simulate: d.simulate,
            simulate_interval: "500ms".into(),
            rescan_interval: "5s".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RawFilters {
    pub max_length:        usize,
    pub rate_limit_rps:    f64,
    pub rate_limit_burst:  u32,
    pub entropy_threshold: f64,
    pub entropy_min_len:   usize,
    pub keywords:          Vec<String>,
    pub governor:          RawGovernor,
}

impl Default for RawFilters {
    fn default() -> Self {
        let d = FilterConfig::default();
        Self {
            max_length: d.max_length,
            rate_limit_rps: d.rate_limit_rps,
            rate_limit_burst: d.rate_limit_burst,
            entropy_threshold: d.entropy_threshold,
            entropy_min_len: d.entropy_min_len,
            keywords: d.keywords,
            governor: RawGovernor::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RawGovernor {
    pub health_threshold: f64,
    pub error_window:     String,
    pub recovery_delay:   String,
    pub smoothing:        f64,
    pub baseline_rps:     f64,
}

impl Default for RawGovernor {
    fn default() -> Self {
        Self {
            health_threshold: 0.95,
            error_window: "1m".into(),
            recovery_delay: "5s".into(),
            smoothing: 0.1,
            baseline_rps: 100.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RawBreaker {
    pub max_failures:    u32,
    pub reset_timeout:   String,
    pub half_open_limit: u32,
}

impl Default for RawBreaker {
    fn default() -> Self {
        Self { max_failures: 5, reset_timeout: "30s".into(), half_open_limit: 3 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RawCoordinator {
    pub queue_size:                usize,
    pub result_queue_size:         usize,
    pub batch_size:                usize,
    pub batch_timeout:             String,
    pub max_retries:               u32,
    pub retry_backoff:             String,
    pub requeue_delay:             String,
    pub partition_strategy:        String,
    pub replication_factor:        usize,
    pub load_balance_strategy:     String,
    pub health_check_interval:     String,
    pub health_check_timeout:      String,
    pub node_timeout:              String,
    pub unhealthy_error_threshold: u64,
    pub drain_timeout:             String,
    pub drain_poll:                String,
    pub dispatch_timeout:          String,
    pub breaker:                   RawBreaker,
}

impl Default for RawCoordinator {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            result_queue_size: 10_000,
            batch_size: 100,
            batch_timeout: "100ms".into(),
            max_retries: 3,
            retry_backoff: "1s".into(),
            requeue_delay: "100ms".into(),
            partition_strategy: "consistent-hash".into(),
            replication_factor: 100,
            load_balance_strategy: "least-loaded".into(),
            health_check_interval: "10s".into(),
            health_check_timeout: "2s".into(),
            node_timeout: "30s".into(),
            unhealthy_error_threshold: 10,
            drain_timeout: "30s".into(),
            drain_poll: "100ms".into(),
            dispatch_timeout: "30s".into(),
            breaker: RawBreaker::default(),
        }
    }
}

/*──────────────────────────── errors ─────────────────────────────────────*/

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error(transparent)]
    Strategy(#[from] UnknownStrategy),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/*──────────────────────────── raw → typed ────────────────────────────────*/

fn dur(s: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(s).map_err(|e| ConfigError::InvalidDuration(s.into(), e))
}

/// Durations that drive a ticker or a poll loop cannot be zero.
fn period(field: &'static str, s: &str) -> Result<Duration, ConfigError> {
    match dur(s)? {
        d if d.is_zero() => Err(ConfigError::ZeroDuration(field)),
        d => Ok(d),
    }
}

fn non_zero(field: &'static str, v: usize) -> Result<usize, ConfigError> {
    if v == 0 {
        return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
    }
    Ok(v)
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let c = raw.capture;
        let capture = CaptureConfig {
            patterns: c.patterns,
            pids: c.pids,
            strace_path: c.strace_path,
            string_limit: c.string_limit,
            attach_grace: dur(&c.attach_grace)?,
            stdio_only: c.stdio_only,
            simulate: c.simulate,
            simulate_interval: period("capture.simulate_interval", &c.simulate_interval)?,
            rescan_interval: period("capture.rescan_interval", &c.rescan_interval)?,
        };

        let f = raw.filters;
        if !(0.0..=1.0).contains(&f.governor.health_threshold) {
            return Err(ConfigError::Invalid {
                field: "filters.governor.health_threshold",
                reason: format!("{} is outside 0..=1", f.governor.health_threshold),
            });
        }
        let filters = FilterConfig {
            max_length: non_zero("filters.max_length", f.max_length)?,
            rate_limit_rps: f.rate_limit_rps,
            rate_limit_burst: f.rate_limit_burst,
            entropy_threshold: f.entropy_threshold,
            entropy_min_len: f.entropy_min_len,
            keywords: f.keywords,
            governor: GovernorConfig {
                health_threshold: f.governor.health_threshold,
                error_window: dur(&f.governor.error_window)?,
                recovery_delay: dur(&f.governor.recovery_delay)?,
                smoothing: f.governor.smoothing,
                baseline_rps: f.governor.baseline_rps,
            },
        };

        let k = raw.coordinator;
        let coordinator = CoordinatorConfig {
            queue_size: non_zero("coordinator.queue_size", k.queue_size)?,
            result_queue_size: non_zero("coordinator.result_queue_size", k.result_queue_size)?,
            batch_size: non_zero("coordinator.batch_size", k.batch_size)?,
            batch_timeout: period("coordinator.batch_timeout", &k.batch_timeout)?,
            max_retries: k.max_retries,
            retry_backoff: dur(&k.retry_backoff)?,
            requeue_delay: dur(&k.requeue_delay)?,
            partition_strategy: k.partition_strategy.parse()?,
            replication_factor: non_zero("coordinator.replication_factor", k.replication_factor)?,
            load_balance_strategy: k.load_balance_strategy.parse()?,
            health_check_interval: period("coordinator.health_check_interval", &k.health_check_interval)?,
            health_check_timeout: dur(&k.health_check_timeout)?,
            node_timeout: dur(&k.node_timeout)?,
            unhealthy_error_threshold: k.unhealthy_error_threshold,
            drain_timeout: dur(&k.drain_timeout)?,
            drain_poll: period("coordinator.drain_poll", &k.drain_poll)?,
            dispatch_timeout: dur(&k.dispatch_timeout)?,
            breaker: BreakerConfig {
                max_failures: k.breaker.max_failures,
                reset_timeout: dur(&k.breaker.reset_timeout)?,
                half_open_limit: k.breaker.half_open_limit,
            },
        };

        for n in &raw.nodes {
            non_zero("nodes.capacity", n.capacity)?;
        }

        Ok(Config {
            logging: raw.logging,
            capture,
            filters,
            coordinator,
            nodes: raw.nodes,
            output: raw.output,
            metrics: raw.metrics,
        })
    }
}
