//! Wiring: config + filesystem flow source + task registry → `FlowEngine`.

use std::path::Path;

use anyhow::Context;
use stepflow_core::flow::subflow::BoxFlowSource;
use stepflow_core::flow::FlowEngine;
use stepflow_core::task::{BoxTaskInvoker, TaskRegistry};
use stepflow_types::config::EngineConfig;

use crate::config::load_project_config;
use crate::flow_source::FileSystemFlowSource;

/// Build an engine that resolves subflows from `config.flow_dirs`.
pub fn build_engine(config: EngineConfig, registry: TaskRegistry) -> anyhow::Result<FlowEngine> {
    registry
        .validate()
        .context("task registry references an unregistered connection provider")?;
    tracing::info!(
        flow_dirs = ?config.flow_dirs,
        tasks = registry.task_names().len(),
        "building flow engine"
    );
    let source = FileSystemFlowSource::new(config.flow_dirs.clone());
    Ok(FlowEngine::new(
        BoxTaskInvoker::new(registry),
        BoxFlowSource::new(source),
        config,
    ))
}

/// Load `{dir}/stepflow.toml` and build an engine rooted at `dir`.
pub async fn open_project(dir: &Path, registry: TaskRegistry) -> anyhow::Result<FlowEngine> {
    let config = load_project_config(dir).await;
    build_engine(config, registry)
        .with_context(|| format!("failed to open stepflow project at {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use stepflow_core::task::registry::TaskCall;
    use tempfile::TempDir;

    #[tokio::test]
    async fn subflows_resolve_from_project_directory() {
        let tmp = TempDir::new().unwrap();
        let flows = tmp.path().join("flows");
        std::fs::create_dir(&flows).unwrap();
        std::fs::write(
            flows.join("greet.yaml"),
            r#"
name: greet
inputs:
  - { name: who, type: string, default: world }
steps:
  - { id: say, type: task, task: echo, inputs: { text: "hello ${inputs.who}" } }
outputs:
  - { name: text, value: "${say.text}" }
"#,
        )
        .unwrap();
        std::fs::write(
            flows.join("main.yaml"),
            r#"
name: main
steps:
  - { id: greeting, type: subflow, flow: greet }
outputs:
  - { name: greeting, value: "${greeting.text}" }
"#,
        )
        .unwrap();

        let engine = open_project(tmp.path(), TaskRegistry::with_builtins())
            .await
            .unwrap();
        let result = engine.execute_named("main", Map::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.outputs["greeting"], json!("hello world"));
    }

    #[test]
    fn unknown_provider_fails_the_build() {
        let mut registry = TaskRegistry::new();
        registry.register_with_connection("query", "postgres", |call: TaskCall| async move {
            Ok(call.inputs)
        });
        let err = build_engine(EngineConfig::default(), registry).unwrap_err();
        assert!(format!("{err:#}").contains("postgres"));
    }
}
