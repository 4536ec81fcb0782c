//! Agent execution boundary.
//!
//! The orchestrator never talks to agents directly; every invocation goes
//! through an [`AgentExecutor`]. [`CommandAgentExecutor`] is the reference
//! implementation that runs an agent as a local sub-process.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use conductor_types::{AgentConfig, AgentResult, ConductorError, Result};

/// Context handed to an executor alongside the agent and its input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionMetadata {
    pub run_id: String,
    pub pipeline_name: String,
    pub stage_id: Option<String>,
    /// 1-based attempt number within the recovery executor.
    pub attempt: u32,
}

impl ExecutionMetadata {
    pub fn for_stage(run_id: &str, pipeline_name: &str, stage_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            pipeline_name: pipeline_name.to_string(),
            stage_id: Some(stage_id.to_string()),
            attempt: 1,
        }
    }
}

/// Runs one agent invocation.
///
/// Ordinary failures (non-zero exit, bad output) are returned as a failed
/// [`AgentResult`]. `Err` is reserved for exceptional conditions such as an
/// agent binary that cannot be spawned.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        agent: &AgentConfig,
        input: Option<&str>,
        metadata: &ExecutionMetadata,
    ) -> Result<AgentResult>;
}

// ---------------------------------------------------------------------------
// CommandAgentExecutor
// ---------------------------------------------------------------------------

/// Spawns `agent.command agent.args...`, writes the input to stdin and
/// captures stdout as the output.
#[derive(Debug, Clone)]
pub struct CommandAgentExecutor {
    /// Grace period between SIGTERM and SIGKILL on timeout.
    pub kill_grace: Duration,
}

impl Default for CommandAgentExecutor {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl AgentExecutor for CommandAgentExecutor {
    async fn execute(
        &self,
        agent: &AgentConfig,
        input: Option<&str>,
        metadata: &ExecutionMetadata,
    ) -> Result<AgentResult> {
        if agent.command.is_empty() {
            return Err(ConductorError::AgentExecution {
                agent: agent.name.clone(),
                message: "agent has no command configured".into(),
            });
        }

        let mut cmd = tokio::process::Command::new(&agent.command);
        cmd.args(&agent.args)
            .envs(&agent.environment)
            .env("CONDUCTOR_RUN_ID", &metadata.run_id)
            .env("CONDUCTOR_PIPELINE", &metadata.pipeline_name)
            .env("CONDUCTOR_STAGE_ID", metadata.stage_id.as_deref().unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &agent.working_dir {
            cmd.current_dir(dir);
        }

        // On Unix, use process_group for clean kill
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let start = tokio::time::Instant::now();
        let mut child = cmd.spawn().map_err(|e| ConductorError::AgentExecution {
            agent: agent.name.clone(),
            message: format!("failed to spawn '{}': {e}", agent.command),
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        let stdin = child.stdin.take();
        let payload = input.unwrap_or_default().as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            }
        });
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_all(stdout));
        let stderr_task = tokio::spawn(read_all(stderr));

        let timeout = Duration::from_millis(agent.timeout_ms);
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                group.disarm();
                let _ = writer.await;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let duration_ms = start.elapsed().as_millis() as u64;

                if status.success() {
                    Ok(AgentResult::success(&agent.name, stdout.trim_end()).with_duration(duration_ms))
                } else {
                    let code = status.code().unwrap_or(-1);
                    let detail = stderr.trim();
                    let error = if detail.is_empty() {
                        format!("exit code {code}")
                    } else {
                        format!("exit code {code}: {detail}")
                    };
                    let mut result = AgentResult::failure(&agent.name, error).with_duration(duration_ms);
                    if !stdout.trim().is_empty() {
                        result.output = Some(stdout.trim_end().to_string());
                    }
                    Ok(result)
                }
            }
            _ = tokio::time::sleep(timeout) => {
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        // SAFETY: signalling our own process group.
                        unsafe { libc::kill(-(pid as i32), libc::SIGTERM); }
                    }
                    tokio::select! {
                        _ = child.wait() => {}
                        _ = tokio::time::sleep(self.kill_grace) => {
                            let _ = child.kill().await;
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = child.kill().await;
                }
                // `group` sweeps stragglers in the process group on drop.
                writer.abort();
                stdout_task.abort();
                stderr_task.abort();

                tracing::warn!(
                    agent = %agent.name,
                    stage = ?metadata.stage_id,
                    timeout_ms = agent.timeout_ms,
                    "Agent process timed out"
                );
                let duration_ms = start.elapsed().as_millis() as u64;
                Ok(AgentResult::failure(
                    &agent.name,
                    format!("Agent '{}' timed out after {} ms", agent.name, agent.timeout_ms),
                )
                .with_duration(duration_ms))
            }
        }
    }
}

/// SIGKILLs the agent's whole process group when the execute future is
/// dropped mid-run (stage timeout, cancellation). `kill_on_drop` only
/// reaches the direct child.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    /// The child was reaped normally; its pid may be reused from here on.
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: signalling the process group created for our child.
            unsafe {
                libc::kill(-(pgid as i32), libc::SIGKILL);
            }
        }
    }
}

async fn read_all<R>(reader: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> AgentConfig {
        AgentConfig::new(name, "sh").with_args(["-c", script])
    }

    fn meta() -> ExecutionMetadata {
        ExecutionMetadata::for_stage("run-1", "demo", "stage-a")
    }

    #[tokio::test]
    async fn echoes_stdin_to_stdout() {
        let result = CommandAgentExecutor::default()
            .execute(&AgentConfig::new("cat", "cat"), Some("hello\n"), &meta())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("hello"));
        assert_eq!(result.agent_name, "cat");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failed_result() {
        let result = CommandAgentExecutor::default()
            .execute(&sh("bad", "echo oops >&2; exit 3"), None, &meta())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("exit code 3: oops"));
    }

    #[tokio::test]
    async fn exposes_run_identity_in_environment() {
        let result = CommandAgentExecutor::default()
            .execute(
                &sh("env", "printf '%s/%s' \"$CONDUCTOR_RUN_ID\" \"$CONDUCTOR_STAGE_ID\""),
                None,
                &meta(),
            )
            .await
            .unwrap();
        assert_eq!(result.output.as_deref(), Some("run-1/stage-a"));
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let mut agent = sh("slow", "sleep 30");
        agent.timeout_ms = 100;
        let executor = CommandAgentExecutor {
            kill_grace: Duration::from_millis(200),
        };
        let start = std::time::Instant::now();
        let result = executor.execute(&agent, None, &meta()).await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Agent 'slow' timed out after 100 ms")
        );
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    /// True once `pid` no longer exists or is only a zombie awaiting reaping.
    #[cfg(target_os = "linux")]
    fn is_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropped_execution_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > '{}'; wait", pidfile.display());
        let agent = sh("spawner", &script);

        let executor = CommandAgentExecutor::default();
        let meta = meta();
        let dropped = tokio::time::timeout(
            Duration::from_millis(500),
            executor.execute(&agent, None, &meta),
        )
        .await;
        assert!(dropped.is_err(), "agent should still be running");

        let pid: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut gone = false;
        for _ in 0..40 {
            if is_gone(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "grandchild {pid} survived the dropped execution");
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let err = CommandAgentExecutor::default()
            .execute(
                &AgentConfig::new("ghost", "/nonexistent/conductor-agent"),
                None,
                &meta(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::AgentExecution { .. }));
    }
}
