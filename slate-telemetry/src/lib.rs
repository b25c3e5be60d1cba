//! Telemetry bootstrap for the SLATE services.
//!
//! Wires the `tracing` subscriber appropriate for the current environment:
//! JSON logs in rotating daily files in production, pretty console output in
//! development. Also installs a panic hook so panics reach the log stream.

mod tracing;

pub use tracing::*;
