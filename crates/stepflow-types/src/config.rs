//! Engine configuration types.
//!
//! `EngineConfig` mirrors the `stepflow.toml` file. Every field has a
//! default so an empty or missing file yields a working engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directories searched (in order) when resolving subflows by name.
    #[serde(default = "default_flow_dirs")]
    pub flow_dirs: Vec<PathBuf>,

    /// Maximum nesting depth of subflow calls.
    #[serde(default = "default_max_subflow_depth")]
    pub max_subflow_depth: usize,

    /// Step outputs larger than this (serialized) are replaced by a
    /// truncation marker.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,

    /// Whether `${env.NAME}` can read process environment variables.
    #[serde(default = "default_true")]
    pub expose_env: bool,

    /// When non-empty, only these variables are visible under `env`.
    #[serde(default)]
    pub env_allowlist: Vec<String>,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging/tracing options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable the OpenTelemetry stdout exporter layer.
    #[serde(default)]
    pub otel: bool,
}

fn default_flow_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("flows")]
}

fn default_max_subflow_depth() -> usize {
    16
}

fn default_max_step_output_bytes() -> usize {
    1_048_576
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flow_dirs: default_flow_dirs(),
            max_subflow_depth: default_max_subflow_depth(),
            max_step_output_bytes: default_max_step_output_bytes(),
            expose_env: true,
            env_allowlist: Vec::new(),
            event_capacity: default_event_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.flow_dirs, vec![PathBuf::from("flows")]);
        assert_eq!(config.max_subflow_depth, 16);
        assert_eq!(config.max_step_output_bytes, 1_048_576);
        assert!(config.expose_env);
        assert!(!config.logging.otel);
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_subflow_depth, 16);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
flow_dirs = ["/srv/flows", "./local"]
max_subflow_depth = 4
expose_env = false
env_allowlist = ["HOME"]

[logging]
otel = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.flow_dirs.len(), 2);
        assert_eq!(config.max_subflow_depth, 4);
        assert!(!config.expose_env);
        assert_eq!(config.env_allowlist, vec!["HOME".to_string()]);
        assert!(config.logging.otel);
        assert_eq!(config.max_step_output_bytes, 1_048_576);
    }
}
