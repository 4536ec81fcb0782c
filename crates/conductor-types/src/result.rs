//! Per-stage and per-run results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata keys written or read by the engine itself.
///
/// Agents may add their own keys; these are the ones the orchestrator, the
/// recovery executor, and the validators rely on.
pub mod metadata_keys {
    /// Number of retries consumed by the recovery executor (0-based).
    pub const RETRIES: &str = "retries";
    /// Output validation score in `[0, 1]`.
    pub const VALIDATION_SCORE: &str = "validationScore";
    /// `; `-joined summary of broken validation rules.
    pub const VALIDATION_VIOLATIONS: &str = "validationViolations";
    /// 1-based iteration number of a LOOP repetition.
    pub const LOOP_ITERATION: &str = "loopIteration";
    /// Id of the LOOP stage that triggered a repetition.
    pub const LOOP_CONTROLLER: &str = "loopController";
    /// Boolean outcome of a DECISION stage.
    pub const DECISION: &str = "decision";
    /// Index of the MAP item an instance ran for.
    pub const FANOUT_INDEX: &str = "fanoutIndex";
    /// The MAP item an instance ran for, rendered as text.
    pub const FANOUT_ITEM: &str = "fanoutItem";
    /// Set to `"true"` when a stage was cut off by its timeout.
    pub const TIMED_OUT: &str = "timedOut";
    /// Recovery strategy applied to the stage.
    pub const RECOVERY_STRATEGY: &str = "recoveryStrategy";
    /// Name of the fallback agent that produced a successful result.
    pub const FALLBACK_AGENT: &str = "fallbackAgent";
    /// Token usage reported by an agent; read by the `tokens()` condition function.
    pub const TOKENS: &str = "tokens";
}

// ---------------------------------------------------------------------------
// AgentResult
// ---------------------------------------------------------------------------

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_name: String,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AgentResult {
    /// Create a successful result with the given output.
    pub fn success(agent_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            success: true,
            output: Some(output.into()),
            error: None,
            duration_ms: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// Create a failed result with the given error message.
    pub fn failure(agent_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            duration_ms: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Derive a copy with an added metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// StageRecord / AggregatedResult
// ---------------------------------------------------------------------------

/// One stage execution as it appears in a run's aggregated result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_id: String,
    pub result: AgentResult,
}

impl StageRecord {
    pub fn new(stage_id: impl Into<String>, result: AgentResult) -> Self {
        Self {
            stage_id: stage_id.into(),
            result,
        }
    }
}

/// Summary of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub total_stages: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_duration_ms: u64,
    pub results: Vec<StageRecord>,
    pub aggregated_output: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl AggregatedResult {
    /// Aggregate stage records in execution order.
    pub fn from_records(results: Vec<StageRecord>) -> Self {
        let success_count = results.iter().filter(|r| r.result.success).count();
        let total_duration_ms = results.iter().map(|r| r.result.duration_ms).sum();
        let aggregated_output = results
            .iter()
            .filter(|r| r.result.success)
            .filter_map(|r| {
                r.result
                    .output
                    .as_ref()
                    .map(|out| format!("[{}]\n{}", r.result.agent_name, out))
            })
            .collect::<Vec<_>>()
            .join("\n---\n");

        Self {
            total_stages: results.len(),
            success_count,
            failure_count: results.len() - success_count,
            total_duration_ms,
            results,
            aggregated_output,
            timestamp: chrono::Utc::now(),
        }
    }

    /// The most recent record for a stage id.
    pub fn result_for(&self, stage_id: &str) -> Option<&AgentResult> {
        self.results
            .iter()
            .rev()
            .find(|r| r.stage_id == stage_id)
            .map(|r| &r.result)
    }

    /// Stage ids in execution order, repeats included.
    pub fn stage_order(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.stage_id.as_str()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.failure_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_constructor() {
        let r = AgentResult::success("echo", "hello");
        assert!(r.success);
        assert_eq!(r.output.as_deref(), Some("hello"));
        assert!(r.error.is_none());
        assert!(r.metadata.is_empty());
    }

    #[test]
    fn failure_constructor() {
        let r = AgentResult::failure("echo", "boom");
        assert!(!r.success);
        assert!(r.output.is_none());
        assert_eq!(r.error.as_deref(), Some("boom"));
    }

    #[test]
    fn with_metadata_derives_annotated_copy() {
        let base = AgentResult::success("echo", "x");
        let annotated = base.clone().with_metadata(metadata_keys::RETRIES, 2);
        assert!(base.metadata.is_empty());
        assert_eq!(annotated.metadata_value("retries"), Some("2"));
    }

    #[test]
    fn aggregate_counts_and_output() {
        let records = vec![
            StageRecord::new("a", AgentResult::success("alpha", "one").with_duration(10)),
            StageRecord::new("b", AgentResult::failure("beta", "bad").with_duration(5)),
            StageRecord::new("c", AgentResult::success("gamma", "three").with_duration(7)),
        ];
        let agg = AggregatedResult::from_records(records);

        assert_eq!(agg.total_stages, 3);
        assert_eq!(agg.success_count, 2);
        assert_eq!(agg.failure_count, 1);
        assert_eq!(agg.total_duration_ms, 22);
        assert_eq!(agg.aggregated_output, "[alpha]\none\n---\n[gamma]\nthree");
        assert!(!agg.is_success());
        assert_eq!(agg.stage_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn result_for_returns_latest_execution() {
        let records = vec![
            StageRecord::new("draft", AgentResult::success("alpha", "v1")),
            StageRecord::new("draft", AgentResult::success("alpha", "v2")),
        ];
        let agg = AggregatedResult::from_records(records);
        assert_eq!(
            agg.result_for("draft").unwrap().output.as_deref(),
            Some("v2")
        );
        assert!(agg.result_for("missing").is_none());
    }

    #[test]
    fn agent_result_ignores_unknown_fields() {
        let json = r#"{
            "agent_name": "echo",
            "success": true,
            "output": "hi",
            "error": null,
            "duration_ms": 3,
            "future_field": 42
        }"#;
        let r: AgentResult = serde_json::from_str(json).unwrap();
        assert_eq!(r.agent_name, "echo");
        assert!(r.metadata.is_empty());
    }
}
