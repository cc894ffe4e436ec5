//! Runtime glue: configuration, retry backoff, telemetry, and the runner that
//! wires the watcher to the fork supervisor.

pub(crate) mod backoff;
pub mod config;
pub mod runner;
pub mod telemetry;
