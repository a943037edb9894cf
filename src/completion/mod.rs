//! The completion pipeline.
//!
//! Turns a `COMPLETION` command into an LLM child invocation while keeping
//! the invariants that matter: at most one in-flight call per agent (FIFO),
//! conversation continuity via `--resume`, paired human/assistant JSONL
//! session logs, and JSON event extraction with diagnostics routed back to
//! the agent that produced the malformed output.

pub mod extraction;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::agents::AgentManager;
use crate::config::LlmConfig;
use crate::identity::{Activity, IdentityManager};
use crate::messaging::{build_event, MessageBus};
use crate::process::{LlmChildError, ProcessSupervisor};
use crate::state::SessionTracker;

/// Pluggable pre-prompt enrichment. The default hook is identity; research
/// builds install temporal/meta-cognitive variants here.
#[async_trait]
pub trait PrePromptHook: Send + Sync {
    async fn enrich(
        &self,
        prompt: String,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> String;
}

/// The identity hook: prompts pass through untouched.
pub struct IdentityHook;

#[async_trait]
impl PrePromptHook for IdentityHook {
    async fn enrich(&self, prompt: String, _: Option<&str>, _: Option<&str>) -> String {
        prompt
    }
}

/// One completion to run.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub request_id: String,
    /// Pre-assigned process id; async callers mint one up front so they
    /// can hand it to the client before the child exists.
    pub process_id: Option<String>,
    pub prompt: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub agent_id: Option<String>,
    pub enable_tools: bool,
}

/// What a finished completion produced.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub process_id: String,
    pub session_id: Option<String>,
    pub response: Value,
    pub events_emitted: usize,
    pub extraction_errors: usize,
}

impl CompletionOutcome {
    pub fn to_result_value(&self) -> Value {
        json!({
            "process_id": self.process_id,
            "session_id": self.session_id,
            "response": self.response,
            "extraction": {
                "events_emitted": self.events_emitted,
                "errors": self.extraction_errors,
            },
        })
    }
}

pub struct CompletionPipeline {
    llm: LlmConfig,
    session_log_dir: PathBuf,
    supervisor: Arc<ProcessSupervisor>,
    sessions: Arc<SessionTracker>,
    agents: Arc<AgentManager>,
    identities: Arc<IdentityManager>,
    bus: Arc<MessageBus>,
    hook: Box<dyn PrePromptHook>,
    /// Per-agent FIFO locks serialising LLM calls.
    agent_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CompletionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: LlmConfig,
        session_log_dir: PathBuf,
        supervisor: Arc<ProcessSupervisor>,
        sessions: Arc<SessionTracker>,
        agents: Arc<AgentManager>,
        identities: Arc<IdentityManager>,
        bus: Arc<MessageBus>,
        hook: Option<Box<dyn PrePromptHook>>,
    ) -> Self {
        Self {
            llm,
            session_log_dir,
            supervisor,
            sessions,
            agents,
            identities,
            bus,
            hook: hook.unwrap_or_else(|| Box::new(IdentityHook)),
            agent_locks: DashMap::new(),
        }
    }

    /// Run one completion to the end: child, session bookkeeping, logs,
    /// event extraction.
    pub async fn run(&self, request: CompletionRequest) -> Result<CompletionOutcome> {
        // Per-agent serialisation. tokio's Mutex queues waiters FIFO, which
        // is exactly the ordering contract.
        let _guard = match &request.agent_id {
            Some(agent_id) => {
                let lock = self
                    .agent_locks
                    .entry(agent_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();
                Some(lock.lock_owned().await)
            }
            None => None,
        };

        let process_id = request
            .process_id
            .clone()
            .unwrap_or_else(|| format!("llm_{}", uuid::Uuid::new_v4()));
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.llm.default_model.clone());

        // A request routed via an agent without naming a session resumes
        // that agent's most recent conversation.
        let resume_session = request.session_id.clone().or_else(|| {
            request
                .agent_id
                .as_deref()
                .and_then(|agent_id| self.agents.get(agent_id))
                .and_then(|info| info.sessions.last().cloned())
        });

        let prompt = self
            .hook
            .enrich(
                request.prompt.clone(),
                request.agent_id.as_deref(),
                resume_session.as_deref(),
            )
            .await;

        tracing::info!(
            request_id = %request.request_id,
            agent_id = request.agent_id.as_deref().unwrap_or("-"),
            session_id = resume_session.as_deref().unwrap_or("-"),
            model = %model,
            "running completion"
        );

        let output = self
            .supervisor
            .run_llm_call(
                &self.llm,
                &process_id,
                &prompt,
                resume_session.as_deref(),
                &model,
                request.agent_id.as_deref(),
                request.enable_tools,
            )
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e @ LlmChildError::NotFound { .. }) => {
                return Ok(CompletionOutcome {
                    process_id,
                    session_id: resume_session.clone(),
                    response: json!({"error": e.to_string()}),
                    events_emitted: 0,
                    extraction_errors: 0,
                });
            }
            Err(e) => return Err(e).context("LLM child failed"),
        };

        if !output.stderr.trim().is_empty() {
            tracing::warn!(
                process_id = %process_id,
                stderr = %output.stderr.trim(),
                "LLM child wrote to stderr"
            );
        }

        if output.stdout.trim().is_empty() {
            return Ok(CompletionOutcome {
                process_id,
                session_id: resume_session.clone(),
                response: json!({
                    "error": "No output from LLM child",
                    "returncode": output.exit_code,
                    "stderr": output.stderr,
                }),
                events_emitted: 0,
                extraction_errors: 0,
            });
        }

        let mut response: Value = match serde_json::from_str(&output.stdout) {
            Ok(v) => v,
            Err(e) => {
                return Ok(CompletionOutcome {
                    process_id,
                    session_id: resume_session.clone(),
                    response: json!({
                        "error": format!("Invalid JSON from LLM child: {e}"),
                        "raw": output.stdout,
                    }),
                    events_emitted: 0,
                    extraction_errors: 0,
                });
            }
        };
        if !output.stderr.trim().is_empty() {
            if let Some(obj) = response.as_object_mut() {
                obj.insert("stderr".to_string(), json!(output.stderr));
            }
        }

        // Session continuity: remember the conversation and log the turn.
        let new_session_id = response
            .get("sessionId")
            .or_else(|| response.get("session_id"))
            .and_then(Value::as_str)
            .map(String::from);

        if let Some(session_id) = &new_session_id {
            self.sessions.track(session_id, response.clone());
            if let Err(e) = self.log_turn(session_id, &request.prompt, &response).await {
                tracing::error!(session_id = %session_id, error = %e, "failed to write session log");
            }
            if let Some(agent_id) = &request.agent_id {
                self.agents.record_session(agent_id, session_id);
                let fresh = resume_session.as_deref() != Some(session_id.as_str());
                if fresh {
                    let _ = self
                        .identities
                        .record_activity(
                            agent_id,
                            Activity::ConversationJoined {
                                session_id: session_id.clone(),
                            },
                        )
                        .await;
                }
            }
        }

        // Emit any events the agent embedded in its response text.
        let text = assistant_text(&response);
        let (events_emitted, extraction_errors) = match &request.agent_id {
            Some(agent_id) if !text.is_empty() => {
                self.emit_extracted_events(agent_id, &text).await
            }
            _ => (0, 0),
        };

        Ok(CompletionOutcome {
            process_id,
            session_id: new_session_id.or(resume_session),
            response,
            events_emitted,
            extraction_errors,
        })
    }

    /// Publish extracted events, then feed parse failures back to the agent
    /// as an `agent:json_extraction_error` event.
    async fn emit_extracted_events(&self, agent_id: &str, text: &str) -> (usize, usize) {
        let (events, errors) = extraction::extract_events(text);
        let mut emitted = 0usize;
        for event in events {
            let mut data = match event.data {
                Value::Object(map) => map,
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            };
            data.insert("_agent_id".to_string(), json!(agent_id));
            data.insert("_extracted_from_response".to_string(), json!(true));
            self.bus
                .publish(agent_id, &event.event, &Value::Object(data))
                .await;
            emitted += 1;
        }

        if !errors.is_empty() {
            let feedback = build_event(
                "daemon",
                "agent:json_extraction_error",
                &json!({
                    "to": agent_id,
                    "errors": errors,
                    "emitted": emitted,
                }),
            );
            self.bus.deliver_to_agent(agent_id, feedback).await;
        }
        (emitted, errors.len())
    }

    /// Append the human turn then the assistant turn to the session log and
    /// repoint `latest.jsonl`.
    async fn log_turn(&self, session_id: &str, prompt: &str, response: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.session_log_dir)
            .await
            .context("failed to create session log directory")?;
        let log_path = self.session_log_dir.join(format!("{session_id}.jsonl"));

        let human = json!({
            "timestamp": ksi_protocol::timestamp_utc(),
            "type": "human",
            "content": prompt,
        });
        let mut assistant = response.clone();
        if let Some(obj) = assistant.as_object_mut() {
            obj.insert("timestamp".to_string(), json!(ksi_protocol::timestamp_utc()));
            obj.insert("type".to_string(), json!("claude"));
        }

        let mut lines = serde_json::to_string(&human)?;
        lines.push('\n');
        lines.push_str(&serde_json::to_string(&assistant)?);
        lines.push('\n');

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("failed to open {}", log_path.display()))?;
        file.write_all(lines.as_bytes()).await?;

        // latest.jsonl always points at the most recent conversation.
        let latest = self.session_log_dir.join("latest.jsonl");
        let _ = tokio::fs::remove_file(&latest).await;
        let target = PathBuf::from(format!("{session_id}.jsonl"));
        tokio::task::spawn_blocking(move || std::os::unix::fs::symlink(target, latest))
            .await
            .context("symlink task panicked")?
            .context("failed to update latest.jsonl")?;
        Ok(())
    }
}

/// Pull the assistant's text out of the response object: the structured
/// `message.content[*].text` form first, then a top-level `result`/`response`
/// string.
fn assistant_text(response: &Value) -> String {
    if let Some(content) = response
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    {
        let joined: Vec<&str> = content
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();
        if !joined.is_empty() {
            return joined.join("\n");
        }
    }
    for key in ["result", "response"] {
        if let Some(text) = response.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::CollectingSink;

    fn fake_llm(dir: &tempfile::TempDir, body: &str) -> LlmConfig {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.path().join("fake-llm");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        LlmConfig {
            program: script.to_string_lossy().into_owned(),
            default_model: "sonnet".to_string(),
            allowed_tools: vec![],
            completion_timeout: 10,
        }
    }

    fn pipeline(dir: &tempfile::TempDir, llm: LlmConfig) -> (CompletionPipeline, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new(None, 100, 10));
        let agents = Arc::new(AgentManager::new(None));
        agents.register("a1", "analyst", vec!["x".to_string()], None);
        let identities = Arc::new(
            IdentityManager::load(dir.path().join("identities.json")).unwrap(),
        );
        let pipeline = CompletionPipeline::new(
            llm,
            dir.path().join("sessions"),
            Arc::new(ProcessSupervisor::new()),
            Arc::new(SessionTracker::new(None)),
            agents,
            identities,
            bus.clone(),
            None,
        );
        (pipeline, bus)
    }

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            request_id: "req-1".to_string(),
            process_id: None,
            prompt: prompt.to_string(),
            session_id: None,
            model: None,
            agent_id: Some("a1".to_string()),
            enable_tools: false,
        }
    }

    #[tokio::test]
    async fn records_session_and_writes_paired_log() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"printf '{"type":"assistant","sessionId":"sess-1","message":{"content":[{"text":"hello"}]}}'"#;
        let (pipeline, _bus) = pipeline(&dir, fake_llm(&dir, body));

        let outcome = pipeline.run(request("say hello")).await.unwrap();
        assert_eq!(outcome.session_id.as_deref(), Some("sess-1"));
        assert!(pipeline.sessions.contains("sess-1"));
        assert_eq!(pipeline.agents.get("a1").unwrap().sessions, vec!["sess-1"]);

        let log = std::fs::read_to_string(dir.path().join("sessions/sess-1.jsonl")).unwrap();
        let lines: Vec<Value> = log
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "human");
        assert_eq!(lines[0]["content"], "say hello");
        assert_eq!(lines[1]["type"], "claude");
        assert_eq!(lines[1]["sessionId"], "sess-1");

        let latest = std::fs::read_link(dir.path().join("sessions/latest.jsonl")).unwrap();
        assert_eq!(latest, PathBuf::from("sess-1.jsonl"));
    }

    #[tokio::test]
    async fn extracts_and_publishes_embedded_events() {
        let dir = tempfile::tempdir().unwrap();
        // Heredoc keeps the embedded escapes byte-for-byte intact.
        let body = "cat <<'EOF'\n{\"type\":\"assistant\",\"sessionId\":\"s2\",\"message\":{\"content\":[{\"text\":\"done {\\\"event\\\": \\\"task:finished\\\", \\\"data\\\": {\\\"n\\\": 3}}\"}]}}\nEOF";
        let (pipeline, bus) = pipeline(&dir, fake_llm(&dir, body));

        let sink = Arc::new(CollectingSink::default());
        bus.connect("watcher", sink.clone()).await;
        bus.subscribe("watcher", &["task:finished".to_string()]).await;

        let outcome = pipeline.run(request("work")).await.unwrap();
        assert_eq!(outcome.events_emitted, 1);
        assert_eq!(outcome.extraction_errors, 0);

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "task:finished");
        assert_eq!(events[0]["n"], 3);
        assert_eq!(events[0]["_agent_id"], "a1");
        assert_eq!(events[0]["_extracted_from_response"], true);
    }

    #[tokio::test]
    async fn extraction_errors_come_back_as_feedback_event() {
        let dir = tempfile::tempdir().unwrap();
        let body = "cat <<'EOF'\n{\"type\":\"assistant\",\"sessionId\":\"s3\",\"message\":{\"content\":[{\"text\":\"oops {'event': 1}\"}]}}\nEOF";
        let (pipeline, bus) = pipeline(&dir, fake_llm(&dir, body));

        let sink = Arc::new(CollectingSink::default());
        bus.connect("a1", sink.clone()).await;

        let outcome = pipeline.run(request("work")).await.unwrap();
        assert_eq!(outcome.events_emitted, 0);
        assert!(outcome.extraction_errors > 0);

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "agent:json_extraction_error");
        assert!(events[0]["errors"][0]["suggestion"]
            .as_str()
            .unwrap()
            .contains("double quotes"));
    }

    #[tokio::test]
    async fn invalid_child_output_is_reported_not_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _bus) = pipeline(&dir, fake_llm(&dir, "printf 'not json at all'"));
        let outcome = pipeline.run(request("hi")).await.unwrap();
        assert!(outcome.response["error"]
            .as_str()
            .unwrap()
            .contains("Invalid JSON"));
    }

    #[tokio::test]
    async fn per_agent_calls_are_serialised() {
        let dir = tempfile::tempdir().unwrap();
        // Each call appends its start and end to a shared file; overlap
        // would interleave starts before ends.
        let marker = dir.path().join("order.log");
        let body = format!(
            "echo start >> {m}\nsleep 0.2\necho end >> {m}\nprintf '{{\"type\":\"assistant\"}}'",
            m = marker.display()
        );
        let (pipeline, _bus) = pipeline(&dir, fake_llm(&dir, &body));
        let pipeline = Arc::new(pipeline);

        let mut handles = Vec::new();
        for i in 0..3 {
            let p = pipeline.clone();
            handles.push(tokio::spawn(async move {
                let mut req = request(&format!("call {i}"));
                req.request_id = format!("req-{i}");
                p.run(req).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let order = std::fs::read_to_string(marker).unwrap();
        let sequence: Vec<&str> = order.lines().collect();
        assert_eq!(sequence.len(), 6);
        for pair in sequence.chunks(2) {
            assert_eq!(pair, ["start", "end"], "calls overlapped: {sequence:?}");
        }
    }

    #[tokio::test]
    async fn second_call_via_agent_resumes_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let args_log = dir.path().join("args.log");
        let body = format!(
            "echo \"$@\" >> {}\nprintf '{{\"type\":\"assistant\",\"sessionId\":\"sess-9\"}}'",
            args_log.display()
        );
        let (pipeline, _bus) = pipeline(&dir, fake_llm(&dir, &body));

        pipeline.run(request("first")).await.unwrap();
        pipeline.run(request("second")).await.unwrap();

        let calls: Vec<String> = std::fs::read_to_string(args_log)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].contains("--resume"));
        assert!(calls[1].contains("--resume sess-9"), "got: {}", calls[1]);
    }

    #[test]
    fn assistant_text_prefers_structured_content() {
        let structured = json!({
            "message": {"content": [{"text": "a"}, {"text": "b"}]},
            "result": "ignored",
        });
        assert_eq!(assistant_text(&structured), "a\nb");

        let flat = json!({"result": "plain"});
        assert_eq!(assistant_text(&flat), "plain");

        assert_eq!(assistant_text(&json!({})), "");
    }
}
