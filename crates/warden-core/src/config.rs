//! Engine configuration
//!
//! Read from a JSON file, then overridden from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use warden_sandbox::task::{DEFAULT_MAX_OUTPUT_LINES, DEFAULT_TIMEOUT_MS};
use warden_sandbox::LoaderConfig;
use warden_trace::{LineTraceArguments, MethodTraceArguments};

pub const ENV_MAX_CONCURRENT_TASKS: &str = "WARDEN_MAX_CONCURRENT_TASKS";
pub const ENV_DEFAULT_TIMEOUT_MS: &str = "WARDEN_DEFAULT_TIMEOUT_MS";

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value {value:?} for {name}")]
    Env { name: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-plugin enable flags and arguments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub line_trace: bool,
    pub line_trace_arguments: LineTraceArguments,
    pub method_trace: bool,
    pub method_trace_arguments: MethodTraceArguments,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Confined tasks allowed to run at once
    pub max_concurrent_tasks: usize,
    pub default_timeout_ms: u64,
    pub max_output_lines: usize,
    pub loader: LoaderConfig,
    pub plugins: PluginConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            loader: LoaderConfig::default(),
            plugins: PluginConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// File (when given) plus process environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `WARDEN_*` overrides looked up through `lookup`
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_MAX_CONCURRENT_TASKS) {
            self.max_concurrent_tasks = parse_env(ENV_MAX_CONCURRENT_TASKS, &value)?;
        }
        if let Some(value) = lookup(ENV_DEFAULT_TIMEOUT_MS) {
            self.default_timeout_ms = parse_env(ENV_DEFAULT_TIMEOUT_MS, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_timeout_ms must be at least 1".to_string(),
            ));
        }
        self.loader
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_tasks, DEFAULT_MAX_CONCURRENT_TASKS);
        assert_eq!(config.default_timeout_ms, 100);
        assert_eq!(config.max_output_lines, 1024);
        assert!(!config.plugins.line_trace);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_concurrent_tasks": 2, "plugins": {{"line_trace": true, "line_trace_arguments": {{"run_line_limit": 10}}}}}}"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.default_timeout_ms, 100);
        assert!(config.plugins.line_trace);
        assert_eq!(config.plugins.line_trace_arguments.run_line_limit, Some(10));
        assert!(config.plugins.line_trace_arguments.coalesce_duplicates);
        assert!(!config.plugins.method_trace);
    }

    #[test]
    fn test_invalid_files_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"loader": {{"allowed_classes": ["a."], "blocked_classes": ["b."]}}}}"#
        )
        .unwrap();
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let missing = tempfile::tempdir().unwrap().path().join("missing.json");
        assert!(matches!(
            EngineConfig::from_file(&missing),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_CONCURRENT_TASKS, "8"),
            (ENV_DEFAULT_TIMEOUT_MS, " 250 "),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::default()
            .with_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.default_timeout_ms, 250);

        let err = EngineConfig::default()
            .with_overrides(|name| (name == ENV_MAX_CONCURRENT_TASKS).then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::default()
            .with_overrides(|name| (name == ENV_DEFAULT_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }
}
