//! Self-regulation: a soft per-filter governor and a hard per-dependency
//! circuit breaker.

pub mod adaptive;
pub mod breaker;

pub use adaptive::{AdaptiveGovernor, GovernorConfig, GovernorSnapshot};
pub use breaker::{BreakerConfig, BreakerError, BreakerSnapshot, BreakerState, CircuitBreaker};
