//! Engine configuration loader.
//!
//! Reads a `stepflow.toml` file and deserializes it into [`EngineConfig`].
//! Falls back to defaults when the file is missing or malformed.

use std::path::Path;

use stepflow_types::config::EngineConfig;

/// Conventional config file name inside a project directory.
pub const CONFIG_FILE_NAME: &str = "stepflow.toml";

/// Load engine configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Load `{dir}/stepflow.toml`, resolving relative `flow_dirs` against `dir`.
pub async fn load_project_config(dir: &Path) -> EngineConfig {
    let mut config = load_engine_config(&dir.join(CONFIG_FILE_NAME)).await;
    for flow_dir in &mut config.flow_dirs {
        if flow_dir.is_relative() {
            *flow_dir = dir.join(&*flow_dir);
        }
    }
    config
}
