// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export everything for both `main.rs` and
// integration tests.

#[macro_use]
pub mod macros;

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod filters;
pub mod governor;
pub mod shutdown;
pub mod sink;
