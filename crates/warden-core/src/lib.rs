//! Warden Core - engine facade over the confined runner
//!
//! Loads configuration, builds the configured plugin set for every
//! program and bounds how many confined tasks run at once.

pub mod config;
pub mod engine;

pub use config::{ConfigError, EngineConfig, PluginConfig};
pub use engine::{Engine, EngineError, RunRequest};
