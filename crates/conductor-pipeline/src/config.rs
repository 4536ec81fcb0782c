//! Project configuration file.
//!
//! ```json
//! {
//!   "agents": [{ "name": "writer", "command": "claude", "args": ["-p"] }],
//!   "pipelines": [{ "name": "review", "stages": [{ "id": "draft", "agent": { "name": "writer" } }] }],
//!   "checkpoint": { "dir": ".conductor/checkpoints", "max_count": 20 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use conductor_types::{AgentConfig, AgentRegistry, ConductorError, Pipeline, Result};

use crate::checkpoint::CheckpointConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl ConductorConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ConductorConfig = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    pub fn registry(&self) -> AgentRegistry {
        self.agents.iter().cloned().collect()
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// Pipeline by name, or the only one when `name` is `None`.
    pub fn select_pipeline(&self, name: Option<&str>) -> Result<&Pipeline> {
        match name {
            Some(name) => self.pipeline(name).ok_or_else(|| {
                ConductorError::Other(format!("No pipeline named '{name}' in configuration"))
            }),
            None => match self.pipelines.as_slice() {
                [only] => Ok(only),
                [] => Err(ConductorError::Other("Configuration defines no pipelines".into())),
                _ => Err(ConductorError::Other(format!(
                    "Configuration defines {} pipelines, pick one with --pipeline",
                    self.pipelines.len()
                ))),
            },
        }
    }

    fn check(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(ConductorError::ValidationError(format!(
                    "Duplicate agent '{}'",
                    agent.name
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for pipeline in &self.pipelines {
            if !seen.insert(pipeline.name.as_str()) {
                return Err(ConductorError::ValidationError(format!(
                    "Duplicate pipeline '{}'",
                    pipeline.name
                )));
            }
        }
        Ok(())
    }
}

/// Read and parse a configuration file.
pub async fn load_config(path: impl AsRef<Path>) -> Result<ConductorConfig> {
    let path = path.as_ref();
    let json = tokio::fs::read_to_string(path).await.map_err(|e| {
        ConductorError::Other(format!("cannot read config {}: {e}", path.display()))
    })?;
    let config = ConductorConfig::from_json(&json)?;
    tracing::debug!(
        path = %path.display(),
        agents = config.agents.len(),
        pipelines = config.pipelines.len(),
        "Configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{ExecutionMode, RecoveryStrategy, StageType};

    const SAMPLE: &str = r#"{
        "agents": [
            { "name": "writer", "command": "cat" },
            { "name": "critic", "command": "sh", "args": ["-c", "cat"], "timeout_ms": 5000 }
        ],
        "pipelines": [{
            "name": "review",
            "execution_mode": "sequential",
            "stages": [
                { "id": "draft", "agent": { "name": "writer" }, "input": "${context.sharedState.topic}",
                  "recovery": { "strategy": "retry_then_fallback", "fallback_agents": ["critic"] } },
                { "id": "gate", "type": "decision",
                  "condition": { "expression": "draft.success", "on_false": { "action": "abort" } } },
                { "id": "again", "type": "loop", "loop": { "target_stage_id": "draft", "max_iterations": 2 } }
            ]
        }],
        "checkpoint": { "max_count": 5 },
        "future_field": true
    }"#;

    #[test]
    fn parses_full_config() {
        let config = ConductorConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.registry().names(), vec!["critic", "writer"]);
        assert_eq!(config.agents[1].timeout_ms, 5000);
        assert_eq!(config.checkpoint.max_count, Some(5));
        assert_eq!(config.checkpoint.dir, CheckpointConfig::default().dir);

        let pipeline = config.select_pipeline(None).unwrap();
        assert_eq!(pipeline.execution_mode, ExecutionMode::Sequential);
        assert_eq!(pipeline.stages[1].stage_type, StageType::Decision);
        assert_eq!(
            pipeline.stages[0].recovery.as_ref().unwrap().strategy,
            RecoveryStrategy::RetryThenFallback
        );
        assert_eq!(pipeline.stages[2].loop_config.as_ref().unwrap().max_iterations, 2);
    }

    #[test]
    fn rejects_duplicate_agents() {
        let json = r#"{ "agents": [ { "name": "a", "command": "x" }, { "name": "a", "command": "y" } ] }"#;
        let err = ConductorConfig::from_json(json).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn pipeline_selection() {
        let config = ConductorConfig::from_json(SAMPLE).unwrap();
        assert!(config.select_pipeline(Some("review")).is_ok());
        assert!(config.select_pipeline(Some("nope")).is_err());
        assert!(ConductorConfig::default().select_pipeline(None).is_err());
    }

    #[tokio::test]
    async fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.json");
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(config.pipelines.len(), 1);

        assert!(load_config(dir.path().join("missing.json")).await.is_err());
    }
}
