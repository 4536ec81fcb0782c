//! Durable per-run checkpoints for resuming partially-failed pipelines.
//!
//! Each run owns one file, `<dir>/<run_id>.json`, overwritten after every
//! stage completion. On resume, [`checkpoint_context`] rebuilds a
//! [`PipelineContext`] holding every recorded stage result and
//! [`resume_point`] picks the first stage that still has to run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_types::{
    AgentResult, ConductorError, Pipeline, PipelineContext, Result, StageRecord,
};

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".conductor/checkpoints")
}

/// Checkpoint location and retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// Keep at most this many checkpoints (newest first).
    #[serde(default)]
    pub max_count: Option<usize>,
    /// Remove checkpoints older than this many days.
    #[serde(default)]
    pub max_age_days: Option<u64>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            max_count: None,
            max_age_days: None,
        }
    }
}

/// One recorded stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub stage_id: String,
    pub agent_name: String,
    pub output: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StageCheckpoint {
    pub fn from_result(stage_id: impl Into<String>, result: &AgentResult) -> Self {
        Self {
            stage_id: stage_id.into(),
            agent_name: result.agent_name.clone(),
            output: result.output.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
            timestamp: Utc::now(),
            error: result.error.clone(),
        }
    }

    /// Latest record per stage id, in order of first appearance.
    pub fn from_records(records: &[StageRecord]) -> Vec<Self> {
        let mut order: Vec<&str> = Vec::new();
        let mut latest: HashMap<&str, &AgentResult> = HashMap::new();
        for record in records {
            if latest.insert(&record.stage_id, &record.result).is_none() {
                order.push(&record.stage_id);
            }
        }
        order
            .into_iter()
            .filter_map(|id| latest.get(id).map(|r| Self::from_result(id, r)))
            .collect()
    }

    pub fn to_result(&self) -> AgentResult {
        AgentResult {
            agent_name: self.agent_name.clone(),
            success: self.success,
            output: self.output.clone(),
            error: self.error.clone(),
            duration_ms: self.duration_ms,
            metadata: Default::default(),
        }
    }
}

/// Everything known about a run at its last save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub conductor_version: String,
    #[serde(default)]
    pub completed_stages: Vec<StageCheckpoint>,
}

impl PipelineCheckpoint {
    pub fn stage(&self, stage_id: &str) -> Option<&StageCheckpoint> {
        self.completed_stages.iter().find(|s| s.stage_id == stage_id)
    }

    fn succeeded(&self, stage_id: &str) -> bool {
        self.stage(stage_id).is_some_and(|s| s.success)
    }
}

/// Listing entry returned by [`CheckpointManager::list`].
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub created_at: DateTime<Utc>,
    pub completed_stages: usize,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        if run_id.is_empty()
            || run_id.contains(['/', '\\'])
            || run_id == "."
            || run_id == ".."
        {
            return Err(ConductorError::Other(format!(
                "invalid run id for checkpoint: '{run_id}'"
            )));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }

    /// Overwrite the checkpoint of `run_id`.
    ///
    /// The file is written next to its final location and renamed into place
    /// so readers never observe a half-written checkpoint.
    pub async fn save(
        &self,
        run_id: &str,
        pipeline_name: &str,
        completed_stages: Vec<StageCheckpoint>,
    ) -> Result<PathBuf> {
        let checkpoint = PipelineCheckpoint {
            pipeline_id: run_id.to_string(),
            pipeline_name: pipeline_name.to_string(),
            created_at: Utc::now(),
            conductor_version: env!("CARGO_PKG_VERSION").to_string(),
            completed_stages,
        };
        self.write(&checkpoint).await
    }

    /// Persist an already-built checkpoint, keeping its timestamps.
    pub async fn write(&self, checkpoint: &PipelineCheckpoint) -> Result<PathBuf> {
        let path = self.path_for(&checkpoint.pipeline_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(checkpoint)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(
            path = %path.display(),
            stages = checkpoint.completed_stages.len(),
            "Checkpoint saved"
        );
        Ok(path)
    }

    /// Load the checkpoint of `run_id`.
    ///
    /// Returns `Ok(None)` when no checkpoint exists or the file cannot be
    /// decoded.
    pub async fn load(&self, run_id: &str) -> Result<Option<PipelineCheckpoint>> {
        let path = self.path_for(run_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(read_checkpoint(&path).await)
    }

    /// Every readable checkpoint, newest first.
    pub async fn list(&self) -> Result<Vec<CheckpointSummary>> {
        let mut summaries: Vec<CheckpointSummary> = self
            .load_all()
            .await?
            .into_iter()
            .map(|(path, cp)| CheckpointSummary {
                pipeline_id: cp.pipeline_id,
                pipeline_name: cp.pipeline_name,
                created_at: cp.created_at,
                completed_stages: cp.completed_stages.len(),
                path,
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Remove the checkpoint of `run_id`. Returns whether a file was deleted.
    pub async fn delete(&self, run_id: &str) -> Result<bool> {
        let path = self.path_for(run_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        tokio::fs::remove_file(&path).await?;
        Ok(true)
    }

    /// Apply retention limits and return the number of deleted checkpoints.
    pub async fn gc(&self, config: &CheckpointConfig) -> Result<usize> {
        let checkpoints = self.list().await?;
        let mut doomed: Vec<&str> = Vec::new();

        if let Some(max_count) = config.max_count {
            for summary in checkpoints.iter().skip(max_count) {
                doomed.push(&summary.pipeline_id);
            }
        }

        // An age too large to represent as a cutoff means no age limit.
        let cutoff = config.max_age_days.and_then(|days| {
            let age = chrono::TimeDelta::try_days(i64::try_from(days).ok()?)?;
            Utc::now().checked_sub_signed(age)
        });
        if let Some(cutoff) = cutoff {
            for summary in &checkpoints {
                if summary.created_at < cutoff && !doomed.contains(&summary.pipeline_id.as_str()) {
                    doomed.push(&summary.pipeline_id);
                }
            }
        }

        let mut deleted = 0;
        for run_id in doomed {
            if self.delete(run_id).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, dir = %self.dir.display(), "Checkpoint GC removed files");
        }
        Ok(deleted)
    }

    async fn load_all(&self) -> Result<Vec<(PathBuf, PipelineCheckpoint)>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(cp) = read_checkpoint(&path).await {
                out.push((path, cp));
            }
        }
        Ok(out)
    }
}

async fn read_checkpoint(path: &Path) -> Option<PipelineCheckpoint> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable checkpoint");
            return None;
        }
    };
    match serde_json::from_str(&json) {
        Ok(cp) => Some(cp),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Corrupt checkpoint ignored");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Resume helpers
// ---------------------------------------------------------------------------

/// Build a run context pre-populated with every checkpointed stage result.
pub async fn checkpoint_context(checkpoint: &PipelineCheckpoint) -> PipelineContext {
    let ctx = PipelineContext::new(&checkpoint.pipeline_id, &checkpoint.pipeline_name);
    for stage in &checkpoint.completed_stages {
        ctx.add_stage_result(&stage.stage_id, stage.to_result()).await;
    }
    ctx
}

/// First stage, in declaration order, without a successful record.
///
/// `None` means every stage already succeeded.
pub fn resume_point(pipeline: &Pipeline, checkpoint: &PipelineCheckpoint) -> Option<String> {
    pipeline
        .stages
        .iter()
        .find(|s| !checkpoint.succeeded(&s.id))
        .map(|s| s.id.clone())
}
