//! Runtime glue that wires configs, hooks, telemetry, fatal error propagation,
//! and runner orchestration.

pub mod config;
pub mod fatal;
pub mod hooks;
pub mod protocol;
pub mod runner;
pub mod telemetry;
