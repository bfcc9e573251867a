//! Boundary shapes shared between the capture core and its consumers.
//!
//! Everything here is plain data: serializable, cloneable and free of any
//! runtime. Sinks, exporters and remote workers only need this crate to read
//! what the agent produces.

pub mod constants;
pub mod events;
pub mod tasks;

mod payload;

pub use events::{Category, Direction, Finding, SecurityAlert, Severity, StreamEvent};
pub use tasks::{ProcessingResult, ProcessingTask, TaskType};
