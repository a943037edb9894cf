//! Child process supervision.
//!
//! Two kinds of children: transient LLM calls that read a prompt on stdin
//! and print one JSON object, and long-lived agent workers spawned by
//! `SPAWN_AGENT`. The supervisor owns both registries; on shutdown it
//! cancels watchers first, then sends SIGTERM and escalates to SIGKILL.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Llm,
    AgentWorker,
}

/// A supervised child, as reported by `GET_PROCESSES`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_id: String,
    pub kind: ProcessKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub model: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Everything an LLM child produced.
#[derive(Debug)]
pub struct LlmOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Raised when the configured LLM binary is missing or dies abnormally.
#[derive(Debug, thiserror::Error)]
pub enum LlmChildError {
    #[error("{program} executable not found in PATH")]
    NotFound { program: String },

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM child failed: {0}")]
    Failed(String),
}

pub struct ProcessSupervisor {
    processes: Arc<DashMap<String, ProcessInfo>>,
    shutdown: Arc<Notify>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(DashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut all: Vec<ProcessInfo> = self.processes.iter().map(|p| p.clone()).collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn get(&self, process_id: &str) -> Option<ProcessInfo> {
        self.processes.get(process_id).map(|p| p.clone())
    }

    /// Run one LLM call to completion: write the prompt to stdin, collect
    /// stdout/stderr, enforce the wall-clock bound. The process appears in
    /// `GET_PROCESSES` for its lifetime.
    pub async fn run_llm_call(
        &self,
        llm: &LlmConfig,
        process_id: &str,
        prompt: &str,
        session_id: Option<&str>,
        model: &str,
        agent_id: Option<&str>,
        enable_tools: bool,
    ) -> Result<LlmOutput, LlmChildError> {
        let mut cmd = Command::new(&llm.program);
        cmd.arg("--model")
            .arg(model)
            .arg("--print")
            .arg("--output-format")
            .arg("json");
        if enable_tools && !llm.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(llm.allowed_tools.join(" "));
        }
        if let Some(session_id) = session_id {
            cmd.arg("--resume").arg(session_id);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LlmChildError::NotFound {
                    program: llm.program.clone(),
                }
            } else {
                LlmChildError::Failed(format!("failed to spawn {}: {e}", llm.program))
            }
        })?;

        self.processes.insert(
            process_id.to_string(),
            ProcessInfo {
                process_id: process_id.to_string(),
                kind: ProcessKind::Llm,
                agent_id: agent_id.map(String::from),
                model: model.to_string(),
                started_at: ksi_protocol::timestamp_utc(),
                session_id: session_id.map(String::from),
                pid: child.id(),
            },
        );

        let result = self
            .drive_llm_child(&mut child, prompt, Duration::from_secs(llm.completion_timeout))
            .await;
        self.processes.remove(process_id);
        result
    }

    async fn drive_llm_child(
        &self,
        child: &mut tokio::process::Child,
        prompt: &str,
        timeout: Duration,
    ) -> Result<LlmOutput, LlmChildError> {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| LlmChildError::Failed(format!("failed to write prompt: {e}")))?;
            drop(stdin);
        }

        let wait = async {
            let output = collect_output(child)
                .await
                .map_err(|e| LlmChildError::Failed(format!("failed to collect output: {e}")))?;
            Ok::<_, LlmChildError>(output)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                let _ = child.start_kill();
                Err(LlmChildError::Timeout(timeout))
            }
        }
    }

    /// Spawn a long-lived agent worker. `on_exit` fires from the watcher
    /// task when the child terminates for any reason.
    pub async fn spawn_agent_worker(
        &self,
        program: &str,
        agent_id: &str,
        socket_path: &std::path::Path,
        system_prompt: &str,
        initial_task: &str,
        initial_context: Option<&Value>,
        on_exit: impl FnOnce(String, Option<i32>) + Send + 'static,
    ) -> Result<ProcessInfo> {
        let process_id = format!("worker_{}", uuid::Uuid::new_v4());
        let mut cmd = Command::new(program);
        cmd.env("KSI_AGENT_ID", agent_id)
            .env("KSI_SOCKET_PATH", socket_path)
            .arg("--task")
            .arg(initial_task)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(context) = initial_context {
            cmd.arg("--context").arg(context.to_string());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent worker {program}"))?;

        // The worker reads its composed system prompt from stdin.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(system_prompt.as_bytes())
                .await
                .context("failed to hand system prompt to worker")?;
            drop(stdin);
        }

        let info = ProcessInfo {
            process_id: process_id.clone(),
            kind: ProcessKind::AgentWorker,
            agent_id: Some(agent_id.to_string()),
            model: String::new(),
            started_at: ksi_protocol::timestamp_utc(),
            session_id: None,
            pid: child.id(),
        };
        self.processes.insert(process_id.clone(), info.clone());

        let processes = Arc::clone(&self.processes);
        let shutdown = self.shutdown.clone();
        let watcher_process_id = process_id.clone();
        let watcher_agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let exit_code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = shutdown.notified() => {
                    terminate_child(&mut child).await;
                    None
                }
            };
            processes.remove(&watcher_process_id);
            tracing::info!(
                agent_id = %watcher_agent_id,
                process_id = %watcher_process_id,
                exit_code,
                "agent worker exited"
            );
            on_exit(watcher_agent_id, exit_code);
        });

        Ok(info)
    }

    /// Ask every watcher to bring its child down, then wait briefly for the
    /// registry to drain.
    pub async fn shutdown_all(&self) {
        self.shutdown.notify_waiters();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.processes.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // Anything left gets removed from the books; the kill_on_drop and
        // signal escalation in the watchers already did their part.
        self.processes.clear();
    }
}

/// SIGTERM, a 3 second grace period, then SIGKILL.
async fn terminate_child(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGTERM);
            match tokio::time::timeout(Duration::from_secs(3), child.wait()).await {
                Ok(_) => return,
                Err(_) => {
                    let _ = kill(pid, Signal::SIGKILL);
                }
            }
        }
    }
    let _ = child.kill().await;
}

/// Collect stdout, stderr and the exit status without consuming the child,
/// so the timeout path can still kill it.
async fn collect_output(child: &mut tokio::process::Child) -> std::io::Result<LlmOutput> {
    use tokio::io::AsyncReadExt;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let stdout_task = async {
        let mut buf = String::new();
        if let Some(out) = stdout.as_mut() {
            out.read_to_string(&mut buf).await?;
        }
        std::io::Result::Ok(buf)
    };
    let stderr_task = async {
        let mut buf = String::new();
        if let Some(err) = stderr.as_mut() {
            err.read_to_string(&mut buf).await?;
        }
        std::io::Result::Ok(buf)
    };

    let (stdout_buf, stderr_buf, status) =
        tokio::try_join!(stdout_task, stderr_task, child.wait())?;

    Ok(LlmOutput {
        stdout: stdout_buf,
        stderr: stderr_buf,
        exit_code: status.code(),
    })
}
