//! Configuration management for the SLATE services.
//!
//! Provides runtime environment detection, layered configuration loading from
//! YAML files with `SLATE_`-prefixed environment variable overrides, and a
//! serde-compatible secret string wrapper for credentials.

mod environment;
mod load;
mod secret;

pub use environment::*;
pub use load::*;
pub use secret::*;
