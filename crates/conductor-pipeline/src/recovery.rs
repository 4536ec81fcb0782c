//! Fault-tolerance wrapper around a single stage execution.
//!
//! [`RecoveryExecutor::execute_with_recovery`] dispatches on the stage's
//! [`RecoveryStrategy`] and validates every successful attempt against the
//! stage's [`StageValidationConfig`](conductor_types::StageValidationConfig).

use std::sync::Arc;
use std::time::Duration;

use conductor_types::{
    metadata_keys, AgentConfig, AgentRegistry, AgentResult, BackoffStrategy, ConductorError,
    PipelineContext, PipelineStage, RecoveryConfig, RecoveryStrategy, Result,
};

use crate::events::{EventEmitter, PipelineEvent};
use crate::executor::{AgentExecutor, ExecutionMetadata};
use crate::output_validation::OutputValidator;

/// Next delay after a failed attempt.
pub fn next_delay(current_ms: u64, config: &RecoveryConfig) -> u64 {
    match config.backoff_strategy {
        BackoffStrategy::Fixed => current_ms,
        BackoffStrategy::Exponential => {
            let scaled = (current_ms as f64 * config.backoff_multiplier).round();
            if scaled.is_finite() && scaled > current_ms as f64 {
                scaled.min(u64::MAX as f64) as u64
            } else {
                current_ms
            }
        }
    }
}

pub struct RecoveryExecutor {
    executor: Arc<dyn AgentExecutor>,
    agents: Arc<AgentRegistry>,
    validator: Arc<dyn OutputValidator>,
    events: EventEmitter,
}

impl RecoveryExecutor {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        agents: Arc<AgentRegistry>,
        validator: Arc<dyn OutputValidator>,
        events: EventEmitter,
    ) -> Self {
        Self {
            executor,
            agents,
            validator,
            events,
        }
    }

    /// Execute `stage` with its recovery policy.
    ///
    /// A stage without a recovery config runs once and executor errors
    /// propagate. `Err` is only returned for exceptional executor failures;
    /// ordinary failures come back as a failed [`AgentResult`].
    pub async fn execute_with_recovery(
        &self,
        stage: &PipelineStage,
        input: Option<&str>,
        ctx: &PipelineContext,
    ) -> Result<AgentResult> {
        let agent_name = stage.agent_name().ok_or_else(|| {
            ConductorError::ValidationError(format!("stage '{}' has no agent", stage.id))
        })?;
        let primary = self
            .agents
            .get(agent_name)
            .ok_or_else(|| ConductorError::AgentNotFound {
                agent: agent_name.to_string(),
            })?;

        let Some(config) = &stage.recovery else {
            return self.run_agent(primary, stage, input, ctx, 1).await;
        };

        let result = match config.strategy {
            RecoveryStrategy::Retry => self.retry(primary, stage, input, ctx, config).await?,
            RecoveryStrategy::Fallback => self.fallback(primary, stage, input, ctx, config).await?,
            RecoveryStrategy::RetryThenFallback => {
                let retried = self.retry(primary, stage, input, ctx, config).await?;
                if retried.success || config.fallback_agents.is_empty() {
                    retried
                } else {
                    self.fallback(primary, stage, input, ctx, config).await?
                }
            }
            RecoveryStrategy::Skip => match self.run_agent(primary, stage, input, ctx, 1).await {
                Ok(result) => result,
                Err(e) => {
                    let reason = error_message(&e);
                    tracing::warn!(stage = %stage.id, reason = %reason, "Optional stage failed, skipping");
                    AgentResult::failure(&primary.name, format!("Stage skipped: {reason}"))
                }
            },
            RecoveryStrategy::Abort => self.run_agent(primary, stage, input, ctx, 1).await?,
        };

        Ok(result.with_metadata(metadata_keys::RECOVERY_STRATEGY, config.strategy))
    }

    async fn retry(
        &self,
        agent: &AgentConfig,
        stage: &PipelineStage,
        input: Option<&str>,
        ctx: &PipelineContext,
        config: &RecoveryConfig,
    ) -> Result<AgentResult> {
        let attempts = config.max_retries.saturating_add(1);
        let mut delay_ms = config.retry_delay_ms;
        let mut retries = 0u32;

        loop {
            let result = self.run_agent(agent, stage, input, ctx, retries + 1).await?;
            if result.success || retries + 1 >= attempts {
                return Ok(result.with_metadata(metadata_keys::RETRIES, retries));
            }

            let error = result.error.as_deref().unwrap_or_default();
            if !config.is_retryable(error) {
                tracing::debug!(stage = %stage.id, error, "Failure not retryable");
                return Ok(result.with_metadata(metadata_keys::RETRIES, retries));
            }

            tracing::warn!(
                stage = %stage.id,
                attempt = retries + 1,
                delay_ms,
                "Stage failed, retrying"
            );
            self.events.emit(PipelineEvent::StageRetrying {
                stage_id: stage.id.clone(),
                run_id: ctx.pipeline_id().to_string(),
                attempt: retries + 2,
                delay_ms,
            });
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = next_delay(delay_ms, config);
            retries += 1;
        }
    }

    async fn fallback(
        &self,
        primary: &AgentConfig,
        stage: &PipelineStage,
        input: Option<&str>,
        ctx: &PipelineContext,
        config: &RecoveryConfig,
    ) -> Result<AgentResult> {
        let primary_result = self.run_agent(primary, stage, input, ctx, 1).await?;
        if primary_result.success {
            return Ok(primary_result);
        }

        tracing::warn!(
            stage = %stage.id,
            agent = %primary.name,
            fallbacks = config.fallback_agents.len(),
            "Primary agent failed, trying fallbacks"
        );
        for (index, name) in config.fallback_agents.iter().enumerate() {
            let Some(fallback) = self.agents.get(name) else {
                tracing::warn!(stage = %stage.id, agent = %name, "Fallback agent not registered");
                continue;
            };
            let attempt = index as u32 + 2;
            match self.run_agent(fallback, stage, input, ctx, attempt).await {
                Ok(result) if result.success => {
                    tracing::info!(stage = %stage.id, agent = %name, "Fallback agent succeeded");
                    return Ok(result.with_metadata(metadata_keys::FALLBACK_AGENT, name));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(stage = %stage.id, agent = %name, error = %e, "Fallback agent errored");
                }
            }
        }

        Ok(primary_result)
    }

    async fn run_agent(
        &self,
        agent: &AgentConfig,
        stage: &PipelineStage,
        input: Option<&str>,
        ctx: &PipelineContext,
        attempt: u32,
    ) -> Result<AgentResult> {
        let metadata = ExecutionMetadata {
            attempt,
            ..ExecutionMetadata::for_stage(ctx.pipeline_id(), ctx.pipeline_name(), &stage.id)
        };
        let result = self.executor.execute(agent, input, &metadata).await?;
        Ok(self.apply_validation(stage, result).await)
    }

    async fn apply_validation(&self, stage: &PipelineStage, result: AgentResult) -> AgentResult {
        let Some(config) = &stage.validation else {
            return result;
        };
        if !result.success || result.output.is_none() {
            return result;
        }

        let outcome = self.validator.validate(&result, config).await;
        let mut result = result.with_metadata(metadata_keys::VALIDATION_SCORE, outcome.score);
        if outcome.valid {
            return result;
        }

        let summary = outcome.violations.join("; ");
        tracing::debug!(stage = %stage.id, score = outcome.score, violations = %summary, "Output validation failed");
        result.success = false;
        result.error = Some(format!("Validation failed: {summary}"));
        result.with_metadata(metadata_keys::VALIDATION_VIOLATIONS, summary)
    }
}

fn error_message(err: &ConductorError) -> String {
    match err {
        ConductorError::AgentExecution { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output_validation::DefaultOutputValidator;
    use async_trait::async_trait;
    use conductor_types::StageValidationConfig;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Executor returning scripted outcomes per agent, in order.
    #[derive(Default)]
    struct Scripted {
        script: Mutex<HashMap<String, Vec<Outcome>>>,
        calls: Mutex<Vec<(String, u32)>>,
    }

    #[derive(Clone)]
    enum Outcome {
        Ok(&'static str),
        Fail(&'static str),
        Error(&'static str),
    }

    impl Scripted {
        fn with(self, agent: &str, outcomes: Vec<Outcome>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(agent.to_string(), outcomes);
            self
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentExecutor for Scripted {
        async fn execute(
            &self,
            agent: &AgentConfig,
            _input: Option<&str>,
            metadata: &ExecutionMetadata,
        ) -> Result<AgentResult> {
            self.calls
                .lock()
                .unwrap()
                .push((agent.name.clone(), metadata.attempt));
            let next = {
                let mut script = self.script.lock().unwrap();
                let queue = script.entry(agent.name.clone()).or_default();
                if queue.len() > 1 {
                    queue.remove(0)
                } else {
                    queue.first().cloned().unwrap_or(Outcome::Ok("default"))
                }
            };
            match next {
                Outcome::Ok(out) => Ok(AgentResult::success(&agent.name, out)),
                Outcome::Fail(err) => Ok(AgentResult::failure(&agent.name, err)),
                Outcome::Error(msg) => Err(ConductorError::AgentExecution {
                    agent: agent.name.clone(),
                    message: msg.to_string(),
                }),
            }
        }
    }

    fn registry() -> Arc<AgentRegistry> {
        Arc::new(
            ["primary", "backup1", "backup2"]
                .into_iter()
                .map(|n| AgentConfig::new(n, "true"))
                .collect(),
        )
    }

    fn recovery_executor(exec: Arc<Scripted>) -> RecoveryExecutor {
        RecoveryExecutor::new(
            exec,
            registry(),
            Arc::new(DefaultOutputValidator::default()),
            EventEmitter::default(),
        )
    }

    fn ctx() -> PipelineContext {
        PipelineContext::new("run-1", "demo")
    }

    fn retry_config(max_retries: u32, delay: u64) -> RecoveryConfig {
        RecoveryConfig {
            max_retries,
            retry_delay_ms: delay,
            retryable_errors: vec!["flaky".into(), "always".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn no_recovery_runs_once_and_propagates_errors() {
        let exec = Arc::new(Scripted::default().with("primary", vec![Outcome::Error("boom")]));
        let rx = recovery_executor(exec.clone());
        let stage = PipelineStage::new("s", "primary");
        let err = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap_err();
        assert!(matches!(err, ConductorError::AgentExecution { .. }));
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn retry_until_success() {
        let exec = Arc::new(Scripted::default().with(
            "primary",
            vec![Outcome::Fail("flaky"), Outcome::Fail("flaky"), Outcome::Ok("done")],
        ));
        let rx = recovery_executor(exec.clone());
        let stage = PipelineStage::new("s", "primary").with_recovery(retry_config(3, 1));
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metadata_value(metadata_keys::RETRIES), Some("2"));
        assert_eq!(result.metadata_value(metadata_keys::RECOVERY_STRATEGY), Some("retry"));
        let attempts: Vec<u32> = exec.calls().into_iter().map(|(_, a)| a).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn retry_exhaustion_waits_with_backoff() {
        let exec = Arc::new(Scripted::default().with("primary", vec![Outcome::Fail("always")]));
        let rx = recovery_executor(exec.clone());
        let stage = PipelineStage::new("s", "primary").with_recovery(retry_config(2, 100));

        let start = std::time::Instant::now();
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        let elapsed = start.elapsed();

        assert!(!result.success);
        assert_eq!(result.metadata_value(metadata_keys::RETRIES), Some("2"));
        assert_eq!(exec.calls().len(), 3);
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn non_retryable_failure_stops_immediately() {
        let exec = Arc::new(Scripted::default().with("primary", vec![Outcome::Fail("invalid api key")]));
        let rx = recovery_executor(exec.clone());
        let mut config = retry_config(3, 1);
        config.retryable_errors = vec!["timeout".into()];
        let stage = PipelineStage::new("s", "primary").with_recovery(config);
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.metadata_value(metadata_keys::RETRIES), Some("0"));
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn empty_retryable_list_runs_once() {
        let exec = Arc::new(Scripted::default().with("primary", vec![Outcome::Fail("invalid api key")]));
        let rx = recovery_executor(exec.clone());
        let config = RecoveryConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            ..Default::default()
        };
        let stage = PipelineStage::new("s", "primary").with_recovery(config);
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.metadata_value(metadata_keys::RETRIES), Some("0"));
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn fallback_uses_first_successful_agent() {
        let exec = Arc::new(
            Scripted::default()
                .with("primary", vec![Outcome::Fail("primary down")])
                .with("backup1", vec![Outcome::Fail("backup1 down")])
                .with("backup2", vec![Outcome::Ok("rescued")]),
        );
        let rx = recovery_executor(exec.clone());
        let stage = PipelineStage::new("s", "primary").with_recovery(RecoveryConfig {
            strategy: RecoveryStrategy::Fallback,
            fallback_agents: vec!["missing".into(), "backup1".into(), "backup2".into()],
            ..Default::default()
        });
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.agent_name, "backup2");
        assert_eq!(result.metadata_value(metadata_keys::FALLBACK_AGENT), Some("backup2"));
    }

    #[tokio::test]
    async fn fallback_exhaustion_returns_primary_failure() {
        let exec = Arc::new(
            Scripted::default()
                .with("primary", vec![Outcome::Fail("primary down")])
                .with("backup1", vec![Outcome::Error("crashed")]),
        );
        let rx = recovery_executor(exec);
        let stage = PipelineStage::new("s", "primary").with_recovery(RecoveryConfig {
            strategy: RecoveryStrategy::Fallback,
            fallback_agents: vec!["backup1".into()],
            ..Default::default()
        });
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.agent_name, "primary");
        assert_eq!(result.error.as_deref(), Some("primary down"));
    }

    #[tokio::test]
    async fn retry_then_fallback_reruns_primary_first() {
        let exec = Arc::new(
            Scripted::default()
                .with("primary", vec![Outcome::Fail("down")])
                .with("backup1", vec![Outcome::Ok("ok")]),
        );
        let rx = recovery_executor(exec.clone());
        let stage = PipelineStage::new("s", "primary").with_recovery(RecoveryConfig {
            strategy: RecoveryStrategy::RetryThenFallback,
            max_retries: 1,
            retry_delay_ms: 1,
            retryable_errors: vec!["down".into()],
            fallback_agents: vec!["backup1".into()],
            ..Default::default()
        });
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        assert_eq!(result.agent_name, "backup1");
        let agents: Vec<String> = exec.calls().into_iter().map(|(a, _)| a).collect();
        assert_eq!(agents, vec!["primary", "primary", "primary", "backup1"]);
    }

    #[tokio::test]
    async fn skip_converts_errors_into_failures() {
        let exec = Arc::new(Scripted::default().with("primary", vec![Outcome::Error("binary missing")]));
        let rx = recovery_executor(exec);
        let stage = PipelineStage::new("s", "primary").with_recovery(RecoveryConfig {
            strategy: RecoveryStrategy::Skip,
            ..Default::default()
        });
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Stage skipped: binary missing"));
    }

    #[tokio::test]
    async fn abort_propagates_errors() {
        let exec = Arc::new(Scripted::default().with("primary", vec![Outcome::Error("boom")]));
        let rx = recovery_executor(exec);
        let stage = PipelineStage::new("s", "primary").with_recovery(RecoveryConfig {
            strategy: RecoveryStrategy::Abort,
            ..Default::default()
        });
        assert!(rx.execute_with_recovery(&stage, None, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn validation_downgrades_success() {
        let exec = Arc::new(Scripted::default().with("primary", vec![Outcome::Ok("short")]));
        let rx = recovery_executor(exec);
        let stage = PipelineStage::new("s", "primary").with_validation(StageValidationConfig {
            min_length: 20,
            required_keywords: vec!["summary".into()],
            ..Default::default()
        });
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Validation failed: Output too short (5 < 20); Missing required keyword: summary")
        );
        assert_eq!(result.metadata_value(metadata_keys::VALIDATION_SCORE), Some("0.75"));
        assert!(result
            .metadata_value(metadata_keys::VALIDATION_VIOLATIONS)
            .unwrap()
            .contains("Output too short"));
    }

    #[tokio::test]
    async fn validation_pass_records_score() {
        let exec = Arc::new(Scripted::default().with("primary", vec![Outcome::Ok("a long enough summary")]));
        let rx = recovery_executor(exec);
        let stage = PipelineStage::new("s", "primary").with_validation(StageValidationConfig {
            min_length: 5,
            ..Default::default()
        });
        let result = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metadata_value(metadata_keys::VALIDATION_SCORE), Some("1"));
    }

    #[tokio::test]
    async fn unknown_agent_is_reported() {
        let rx = recovery_executor(Arc::new(Scripted::default()));
        let stage = PipelineStage::new("s", "ghost");
        let err = rx.execute_with_recovery(&stage, None, &ctx()).await.unwrap_err();
        assert!(matches!(err, ConductorError::AgentNotFound { .. }));
    }

    #[test]
    fn delay_progression() {
        let exp = retry_config(3, 100);
        assert_eq!(next_delay(100, &exp), 200);
        assert_eq!(next_delay(200, &exp), 400);

        let fixed = RecoveryConfig {
            backoff_strategy: BackoffStrategy::Fixed,
            ..exp
        };
        assert_eq!(next_delay(100, &fixed), 100);
    }
}
