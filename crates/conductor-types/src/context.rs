//! Per-run state shared by every stage task of a pipeline run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::result::AgentResult;

// ---------------------------------------------------------------------------
// PipelineContext
// ---------------------------------------------------------------------------

/// Thread-safe run context.
///
/// Cloning a `PipelineContext` yields another handle to the **same** state.
/// Use [`clone_isolated`](PipelineContext::clone_isolated) to get a deep copy
/// for fan-out instances that must not see each other's writes.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pipeline_id: Arc<str>,
    pipeline_name: Arc<str>,
    started: Instant,
    inner: Arc<tokio::sync::RwLock<ContextState>>,
}

#[derive(Debug, Clone, Default)]
struct ContextState {
    stage_results: HashMap<String, AgentResult>,
    completion_order: Vec<String>,
    shared_state: HashMap<String, serde_json::Value>,
    metadata: HashMap<String, String>,
    current_stage_index: usize,
}

impl PipelineContext {
    pub fn new(pipeline_id: impl Into<String>, pipeline_name: impl Into<String>) -> Self {
        Self {
            pipeline_id: Arc::from(pipeline_id.into()),
            pipeline_name: Arc::from(pipeline_name.into()),
            started: Instant::now(),
            inner: Arc::new(tokio::sync::RwLock::new(ContextState::default())),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Same state under a different run identity. Used when a seed context
    /// built outside the orchestrator is adopted by a run.
    pub fn rebind(&self, pipeline_id: impl Into<String>, pipeline_name: impl Into<String>) -> Self {
        Self {
            pipeline_id: Arc::from(pipeline_id.into()),
            pipeline_name: Arc::from(pipeline_name.into()),
            started: self.started,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Record a completed stage. A re-executed stage replaces its earlier
    /// result and moves to the end of the completion order.
    pub async fn add_stage_result(&self, stage_id: impl Into<String>, result: AgentResult) {
        let stage_id = stage_id.into();
        let mut guard = self.inner.write().await;
        guard.completion_order.retain(|id| id != &stage_id);
        guard.completion_order.push(stage_id.clone());
        guard.stage_results.insert(stage_id, result);
    }

    pub async fn stage_result(&self, stage_id: &str) -> Option<AgentResult> {
        self.inner.read().await.stage_results.get(stage_id).cloned()
    }

    /// Output of a stage, when it completed with one.
    pub async fn stage_output(&self, stage_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .stage_results
            .get(stage_id)
            .and_then(|r| r.output.clone())
    }

    pub async fn completed_stages(&self) -> Vec<String> {
        self.inner.read().await.completion_order.clone()
    }

    pub async fn set_shared(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.shared_state.insert(key.into(), value);
    }

    pub async fn get_shared(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.shared_state.get(key).cloned()
    }

    /// Merge `updates` into shared state. Keys not present in `updates` are
    /// preserved.
    pub async fn apply_shared_state(&self, updates: &BTreeMap<String, serde_json::Value>) {
        if updates.is_empty() {
            return;
        }
        let mut guard = self.inner.write().await;
        for (key, value) in updates {
            guard.shared_state.insert(key.clone(), value.clone());
        }
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .write()
            .await
            .metadata
            .insert(key.into(), value.into());
    }

    pub async fn get_metadata(&self, key: &str) -> Option<String> {
        self.inner.read().await.metadata.get(key).cloned()
    }

    pub async fn set_current_stage_index(&self, index: usize) {
        self.inner.write().await.current_stage_index = index;
    }

    pub async fn current_stage_index(&self) -> usize {
        self.inner.read().await.current_stage_index
    }

    /// Deep copy that is fully independent of the original context.
    pub async fn clone_isolated(&self) -> PipelineContext {
        let guard = self.inner.read().await;
        PipelineContext {
            pipeline_id: Arc::clone(&self.pipeline_id),
            pipeline_name: Arc::clone(&self.pipeline_name),
            started: self.started,
            inner: Arc::new(tokio::sync::RwLock::new(guard.clone())),
        }
    }

    /// Immutable point-in-time view for template rendering and condition
    /// evaluation.
    pub async fn snapshot(&self) -> ContextSnapshot {
        let guard = self.inner.read().await;
        ContextSnapshot {
            pipeline_id: self.pipeline_id.to_string(),
            pipeline_name: self.pipeline_name.to_string(),
            stage_results: guard.stage_results.clone(),
            completion_order: guard.completion_order.clone(),
            shared_state: guard.shared_state.clone(),
            metadata: guard.metadata.clone(),
            elapsed_ms: self.elapsed_ms(),
            current_stage_index: guard.current_stage_index,
        }
    }
}

// ---------------------------------------------------------------------------
// ContextSnapshot
// ---------------------------------------------------------------------------

/// Plain-data copy of a [`PipelineContext`].
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub stage_results: HashMap<String, AgentResult>,
    pub completion_order: Vec<String>,
    pub shared_state: HashMap<String, serde_json::Value>,
    pub metadata: HashMap<String, String>,
    pub elapsed_ms: u64,
    pub current_stage_index: usize,
}

impl ContextSnapshot {
    pub fn stage_output(&self, stage_id: &str) -> Option<&str> {
        self.stage_results
            .get(stage_id)
            .and_then(|r| r.output.as_deref())
    }

    /// Every stage output in completion order, as `[stage]\noutput` blocks.
    pub fn all_outputs(&self) -> String {
        self.render_outputs(|_| true)
    }

    /// Like [`all_outputs`](Self::all_outputs), restricted to successful stages.
    pub fn successful_outputs(&self) -> String {
        self.render_outputs(|r| r.success)
    }

    fn render_outputs(&self, keep: impl Fn(&AgentResult) -> bool) -> String {
        self.completion_order
            .iter()
            .filter_map(|id| {
                let result = self.stage_results.get(id)?;
                if !keep(result) {
                    return None;
                }
                let output = result.output.as_deref()?;
                Some(format!("[{id}]\n{output}"))
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stage_results_and_completion_order() {
        let ctx = PipelineContext::new("run-1", "demo");
        ctx.add_stage_result("a", AgentResult::success("echo", "A"))
            .await;
        ctx.add_stage_result("b", AgentResult::failure("echo", "bad"))
            .await;
        ctx.add_stage_result("a", AgentResult::success("echo", "A2"))
            .await;

        assert_eq!(ctx.completed_stages().await, vec!["b", "a"]);
        assert_eq!(ctx.stage_output("a").await.as_deref(), Some("A2"));
        assert!(ctx.stage_output("b").await.is_none());
        assert!(ctx.stage_result("missing").await.is_none());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let ctx = PipelineContext::new("run-1", "demo");
        let handle = ctx.clone();
        handle.set_shared("goal", json!("ship")).await;
        assert_eq!(ctx.get_shared("goal").await, Some(json!("ship")));
    }

    #[tokio::test]
    async fn clone_isolated_is_independent() {
        let ctx = PipelineContext::new("run-1", "demo");
        ctx.set_metadata("owner", "ops").await;

        let copy = ctx.clone_isolated().await;
        copy.set_metadata("owner", "dev").await;
        copy.set_shared("item", json!(1)).await;

        assert_eq!(ctx.get_metadata("owner").await.as_deref(), Some("ops"));
        assert!(ctx.get_shared("item").await.is_none());
        assert_eq!(copy.pipeline_id(), "run-1");
    }

    #[tokio::test]
    async fn apply_shared_state_merges() {
        let ctx = PipelineContext::new("run-1", "demo");
        ctx.set_shared("keep", json!("yes")).await;

        let mut updates = BTreeMap::new();
        updates.insert("route".to_string(), json!("fast"));
        ctx.apply_shared_state(&updates).await;

        let snap = ctx.snapshot().await;
        assert_eq!(snap.shared_state.get("keep"), Some(&json!("yes")));
        assert_eq!(snap.shared_state.get("route"), Some(&json!("fast")));
    }

    #[tokio::test]
    async fn snapshot_renders_outputs() {
        let ctx = PipelineContext::new("run-1", "demo");
        ctx.add_stage_result("first", AgentResult::success("echo", "one"))
            .await;
        let mut failed = AgentResult::failure("echo", "boom");
        failed.output = Some("partial".into());
        ctx.add_stage_result("second", failed).await;
        ctx.add_stage_result("third", AgentResult::success("echo", "three"))
            .await;
        ctx.set_current_stage_index(2).await;

        let snap = ctx.snapshot().await;
        assert_eq!(snap.pipeline_name, "demo");
        assert_eq!(snap.current_stage_index, 2);
        assert_eq!(
            snap.all_outputs(),
            "[first]\none\n\n[second]\npartial\n\n[third]\nthree"
        );
        assert_eq!(snap.successful_outputs(), "[first]\none\n\n[third]\nthree");
        assert_eq!(snap.stage_output("third"), Some("three"));
    }

    #[tokio::test]
    async fn rebind_keeps_state() {
        let seed = PipelineContext::new("old", "demo");
        seed.add_stage_result("a", AgentResult::success("echo", "A"))
            .await;
        let bound = seed.rebind("new", "demo");
        assert_eq!(bound.pipeline_id(), "new");
        assert_eq!(bound.stage_output("a").await.as_deref(), Some("A"));
    }
}
