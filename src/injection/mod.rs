//! The injection router.
//!
//! Lets agents (and the completion pipeline itself) schedule content into
//! future LLM calls: `direct` mode queues an immediate completion through a
//! single processor task; `next` mode stores content keyed by session until
//! the next outbound prompt for that session picks it up. A depth circuit
//! breaker bounds injection chains; token and time budgets are carried and
//! reported but deliberately not enforced yet.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ksi_protocol::commands::{
    CircuitBreakerConfig, InjectionConfig, InjectionInjectParams, InjectionMetadata,
    InjectionMode, InjectionPosition,
};

use crate::composer::PromptComposer;
use crate::messaging::MessageBus;

/// Default time-to-live for stored next-mode injections.
pub const NEXT_MODE_TTL_SECS: i64 = 3_600;

/// A stored next-mode injection waiting for its session's next prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedInjection {
    pub content: String,
    pub position: InjectionPosition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    pub timestamp: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<String>,
}

impl QueuedInjection {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A direct-mode injection handed to the queue processor; it becomes a
/// fresh completion request tagged `is_injection`.
#[derive(Debug, Clone)]
pub struct InjectionExecution {
    pub request_id: String,
    pub content: String,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub parent_request_id: Option<String>,
}

/// Depth tracker for injection chains.
#[derive(Default)]
struct CircuitBreaker {
    depth: DashMap<String, u32>,
    blocked: DashSet<String>,
}

impl CircuitBreaker {
    /// Record this request in its chain and decide whether injection may
    /// proceed. The (max_depth)-th link in a chain is refused.
    fn check_allowed(&self, request_id: &str, config: &CircuitBreakerConfig) -> bool {
        if self.blocked.contains(request_id) {
            return false;
        }
        match &config.parent_request_id {
            Some(parent) => {
                let parent_depth = self.depth.get(parent).map(|d| *d).unwrap_or(0);
                let current = parent_depth + 1;
                if current >= config.max_depth {
                    tracing::warn!(
                        request_id,
                        depth = current,
                        max_depth = config.max_depth,
                        "injection blocked by circuit breaker"
                    );
                    self.blocked.insert(request_id.to_string());
                    false
                } else {
                    self.depth.insert(request_id.to_string(), current);
                    true
                }
            }
            None => {
                self.depth.insert(request_id.to_string(), 0);
                true
            }
        }
    }

    fn status(&self, parent_request_id: Option<&str>) -> Value {
        let defaults = CircuitBreakerConfig::default();
        let depth = parent_request_id
            .map(|parent| self.depth.get(parent).map(|d| *d).unwrap_or(0) + 1)
            .unwrap_or(0);
        json!({
            "depth": depth,
            "max_depth": defaults.max_depth,
            "tokens_used": 0,
            "token_budget": defaults.token_budget,
            "time_elapsed": 0,
            "time_window": defaults.time_window_secs,
        })
    }
}

/// Stored per-request injection metadata.
#[derive(Debug, Clone)]
struct StoredMetadata {
    metadata: InjectionMetadata,
    #[allow(dead_code)]
    stored_at: DateTime<Utc>,
}

pub struct InjectionRouter {
    bus: Arc<MessageBus>,
    /// Renders the `async_completion_result` template when available;
    /// otherwise the built-in fallback format applies.
    composer: Option<Arc<PromptComposer>>,
    metadata: DashMap<String, StoredMetadata>,
    breaker: CircuitBreaker,
    /// session_id -> pending next-mode injections
    next_queue: DashMap<String, Vec<QueuedInjection>>,
    queue_tx: async_channel::Sender<Option<InjectionExecution>>,
    queue_rx: async_channel::Receiver<Option<InjectionExecution>>,
}

impl InjectionRouter {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        Self {
            bus,
            composer: None,
            metadata: DashMap::new(),
            breaker: CircuitBreaker::default(),
            next_queue: DashMap::new(),
            queue_tx,
            queue_rx,
        }
    }

    pub fn with_composer(mut self, composer: Arc<PromptComposer>) -> Self {
        self.composer = Some(composer);
        self
    }

    /// Receiver side for the daemon's queue processor task. `None` is the
    /// shutdown sentinel.
    pub fn queue_receiver(&self) -> async_channel::Receiver<Option<InjectionExecution>> {
        self.queue_rx.clone()
    }

    /// Ask the queue processor to exit after draining.
    pub async fn shutdown(&self) {
        let _ = self.queue_tx.send(None).await;
    }

    pub fn status(&self) -> Value {
        json!({
            "queued_count": self.queue_tx.len(),
            "metadata_count": self.metadata.len(),
            "blocked_count": self.breaker.blocked.len(),
            "pending_sessions": self.next_queue.len(),
        })
    }

    pub fn breaker_status(&self, parent_request_id: Option<&str>) -> Value {
        self.breaker.status(parent_request_id)
    }

    /// Unified injection entry point (`INJECTION_INJECT`).
    pub async fn inject(&self, params: InjectionInjectParams) -> Value {
        match params.mode {
            InjectionMode::Next => {
                let Some(session_id) = params.session_id else {
                    return json!({
                        "success": false,
                        "mode": "next",
                        "error": "next mode requires session_id",
                        "error_type": "no_session",
                    });
                };
                let position = self.store_next(
                    &session_id,
                    params.content,
                    params.position,
                    None,
                    None,
                );
                json!({
                    "success": true,
                    "mode": "next",
                    "queued": true,
                    "session_id": session_id,
                    "queue_position": position,
                })
            }
            InjectionMode::Direct => {
                let request_id = format!("inj_{}", uuid::Uuid::new_v4());
                let execution = InjectionExecution {
                    request_id: request_id.clone(),
                    content: wrap_position(params.content, params.position),
                    session_id: params.session_id.clone(),
                    agent_id: None,
                    parent_request_id: None,
                };
                if self.queue_tx.send(Some(execution)).await.is_err() {
                    return json!({
                        "success": false,
                        "mode": "direct",
                        "error": "injection queue is closed",
                        "error_type": "queue_full",
                    });
                }
                json!({
                    "success": true,
                    "mode": "direct",
                    "queued": true,
                    "request_id": request_id,
                })
            }
        }
    }

    /// Batch of unified injections; preserves order, reports per-item.
    pub async fn inject_batch(&self, injections: Vec<InjectionInjectParams>) -> Value {
        let mut results = Vec::with_capacity(injections.len());
        for params in injections {
            results.push(self.inject(params).await);
        }
        let succeeded = results
            .iter()
            .filter(|r| r["success"].as_bool().unwrap_or(false))
            .count();
        json!({
            "total": results.len(),
            "succeeded": succeeded,
            "results": results,
        })
    }

    /// Pending next-mode injections, optionally for one session.
    pub fn list_pending(&self, session_id: Option<&str>) -> Value {
        let now = Utc::now();
        let collect = |session: &str, queue: &Vec<QueuedInjection>| -> Value {
            let live: Vec<&QueuedInjection> =
                queue.iter().filter(|q| !q.is_expired(now)).collect();
            json!({"session_id": session, "count": live.len(), "injections": live})
        };
        match session_id {
            Some(session) => {
                let pending = self
                    .next_queue
                    .get(session)
                    .map(|q| collect(session, &q))
                    .unwrap_or_else(|| json!({"session_id": session, "count": 0, "injections": []}));
                json!({"sessions": [pending]})
            }
            None => {
                let mut sessions: Vec<Value> = self
                    .next_queue
                    .iter()
                    .map(|entry| collect(entry.key(), entry.value()))
                    .collect();
                sessions.sort_by(|a, b| {
                    a["session_id"]
                        .as_str()
                        .unwrap_or("")
                        .cmp(b["session_id"].as_str().unwrap_or(""))
                });
                json!({"sessions": sessions})
            }
        }
    }

    /// Clear stored next-mode injections for a session. `mode` other than
    /// `next` clears nothing: direct injections live only in the channel.
    pub fn clear(&self, session_id: &str, mode: Option<InjectionMode>) -> Value {
        let cleared = match mode {
            None | Some(InjectionMode::Next) => self
                .next_queue
                .remove(session_id)
                .map(|(_, q)| q.len())
                .unwrap_or(0),
            Some(InjectionMode::Direct) => 0,
        };
        json!({"session_id": session_id, "cleared": cleared})
    }

    /// Register metadata for an in-flight completion (`INJECTION_QUEUE`).
    pub fn queue_metadata(
        &self,
        id: Option<String>,
        injection_config: Option<InjectionConfig>,
        circuit_breaker_config: Option<CircuitBreakerConfig>,
    ) -> String {
        let request_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.store_metadata(
            &request_id,
            InjectionMetadata {
                injection_config,
                circuit_breaker_config,
                is_injection: false,
            },
        );
        request_id
    }

    fn store_metadata(&self, request_id: &str, metadata: InjectionMetadata) {
        self.metadata.insert(
            request_id.to_string(),
            StoredMetadata {
                metadata,
                stored_at: Utc::now(),
            },
        );
    }

    pub fn metadata_for(&self, request_id: &str) -> Option<InjectionMetadata> {
        self.metadata.get(request_id).map(|m| m.metadata.clone())
    }

    /// Fold a finished completion back into the loop
    /// (`INJECTION_PROCESS_RESULT`). Returns the routing outcome.
    pub async fn process_result(
        &self,
        request_id: &str,
        result: &Value,
        injection_metadata: &InjectionMetadata,
    ) -> Value {
        let errored =
            result.get("error").is_some() || result.pointer("/response/error").is_some();
        if errored {
            tracing::warn!(request_id, "completion errored, skipping injection");
            return json!({"status": "skipped", "reason": "completion_error"});
        }

        let Some(config) = injection_metadata.injection_config.as_ref() else {
            return json!({"status": "skipped", "reason": "not_enabled"});
        };
        if !config.enabled {
            return json!({"status": "skipped", "reason": "not_enabled"});
        }
        if injection_metadata.is_injection {
            tracing::debug!(request_id, "refusing to re-inject an injected completion");
            return json!({"status": "skipped", "reason": "is_injection"});
        }

        self.store_metadata(request_id, injection_metadata.clone());

        let breaker_config = injection_metadata
            .circuit_breaker_config
            .clone()
            .unwrap_or_default();
        if !self.breaker.check_allowed(request_id, &breaker_config) {
            self.bus
                .publish(
                    "daemon",
                    "injection:blocked",
                    &json!({"request_id": request_id, "reason": "circuit_breaker"}),
                )
                .await;
            return json!({
                "status": "blocked",
                "reason": "circuit_breaker",
                "request_id": request_id,
            });
        }

        let completion_text = completion_text(result);
        let content = self.compose_content(&completion_text, config, &breaker_config);

        let targets: Vec<String> = if config.target_sessions.is_empty() {
            vec!["originating".to_string()]
        } else {
            config.target_sessions.clone()
        };

        match config.mode {
            InjectionMode::Direct => {
                let mut queued = 0usize;
                for session_id in &targets {
                    let execution = InjectionExecution {
                        request_id: format!("inj_{request_id}_{queued}"),
                        content: content.clone(),
                        session_id: Some(session_id.clone()),
                        agent_id: None,
                        parent_request_id: Some(request_id.to_string()),
                    };
                    if self.queue_tx.send(Some(execution)).await.is_ok() {
                        queued += 1;
                        self.bus
                            .publish(
                                "daemon",
                                "injection:queued",
                                &json!({
                                    "request_id": request_id,
                                    "session_id": session_id,
                                    "mode": "direct",
                                }),
                            )
                            .await;
                    }
                }
                json!({
                    "status": "queued",
                    "request_id": request_id,
                    "target_count": queued,
                    "mode": "direct",
                })
            }
            InjectionMode::Next => {
                let mut stored = 0usize;
                for session_id in &targets {
                    self.store_next(
                        session_id,
                        content.clone(),
                        config.position,
                        Some(request_id.to_string()),
                        config.trigger_type.clone(),
                    );
                    stored += 1;
                    self.bus
                        .publish(
                            "daemon",
                            "injection:stored",
                            &json!({
                                "request_id": request_id,
                                "session_id": session_id,
                                "mode": "next",
                                "position": config.position,
                            }),
                        )
                        .await;
                }
                json!({
                    "status": "stored",
                    "request_id": request_id,
                    "target_count": stored,
                    "mode": "next",
                })
            }
        }
    }

    /// Drain pending non-expired injections for a session; called by the
    /// completion path as it assembles the next outbound prompt.
    pub fn take_pending(&self, session_id: &str) -> Vec<QueuedInjection> {
        let now = Utc::now();
        match self.next_queue.remove(session_id) {
            Some((_, queue)) => queue.into_iter().filter(|q| !q.is_expired(now)).collect(),
            None => Vec::new(),
        }
    }

    /// Merge pending injections into a prompt per their positions.
    pub fn apply_pending(&self, session_id: &str, prompt: &str) -> String {
        let pending = self.take_pending(session_id);
        if pending.is_empty() {
            return prompt.to_string();
        }
        let mut before = Vec::new();
        let mut after = Vec::new();
        for injection in pending {
            match injection.position {
                InjectionPosition::BeforePrompt => before.push(injection.content),
                InjectionPosition::AfterPrompt => after.push(injection.content),
                InjectionPosition::SystemReminder => before.push(format!(
                    "<system-reminder>\n{}\n</system-reminder>",
                    injection.content
                )),
            }
        }
        let mut parts = before;
        parts.push(prompt.to_string());
        parts.extend(after);
        parts.join("\n\n")
    }

    fn store_next(
        &self,
        session_id: &str,
        content: String,
        position: InjectionPosition,
        parent_request_id: Option<String>,
        trigger_type: Option<String>,
    ) -> usize {
        let mut queue = self.next_queue.entry(session_id.to_string()).or_default();
        queue.push(QueuedInjection {
            content,
            position,
            parent_request_id,
            timestamp: ksi_protocol::timestamp_utc(),
            expires_at: Utc::now() + Duration::seconds(NEXT_MODE_TTL_SECS),
            trigger_type,
        });
        queue.len()
    }

    /// Follow-up content for a returned async completion. A composer
    /// template may replace this wholesale; the built-in format carries the
    /// result and the breaker status.
    fn compose_content(
        &self,
        completion_text: &str,
        config: &InjectionConfig,
        breaker_config: &CircuitBreakerConfig,
    ) -> String {
        let status = self
            .breaker
            .status(breaker_config.parent_request_id.as_deref());

        if let Some(composer) = &self.composer {
            let context = json!({
                "completion_result": completion_text,
                "trigger_type": config.trigger_type.clone().unwrap_or_else(|| "general".into()),
                "circuit_breaker_status": status.clone(),
            });
            match composer.compose("async_completion_result", &context) {
                Ok(rendered) => return wrap_position(rendered, config.position),
                Err(e) => {
                    tracing::warn!(error = %e, "composer failed for injection, using fallback")
                }
            }
        }

        let depth = status["depth"].as_u64().unwrap_or(0);
        let mut content = format!(
            "## Async Completion Result\n\n\
             An asynchronous completion has returned with the following result:\n\n\
             {completion_text}\n\n\
             Consider if this requires any follow-up actions."
        );
        if depth > 0 {
            content.push_str(&format!(
                "\n\n## Circuit Breaker Status\n\
                 - Ideation Depth: {}/{}\n\
                 - Token Budget: {}/{}\n\
                 - Time Window: {}/{}s",
                depth,
                status["max_depth"],
                status["tokens_used"],
                status["token_budget"],
                status["time_elapsed"],
                status["time_window"],
            ));
        }
        wrap_position(content, config.position)
    }
}

fn wrap_position(content: String, position: InjectionPosition) -> String {
    match position {
        InjectionPosition::SystemReminder => {
            format!("<system-reminder>\n{content}\n</system-reminder>")
        }
        _ => content,
    }
}

/// Completion text out of a result object, whatever its exact shape.
fn completion_text(result: &Value) -> String {
    for key in ["response", "result"] {
        if let Some(text) = result.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    if let Some(content) = result
        .pointer("/response/message/content")
        .or_else(|| result.pointer("/message/content"))
        .and_then(Value::as_array)
    {
        let joined: Vec<&str> = content
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();
        if !joined.is_empty() {
            return joined.join("\n");
        }
    }
    result.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> InjectionRouter {
        InjectionRouter::new(Arc::new(MessageBus::new(None, 100, 10)))
    }

    fn enabled_metadata(parent: Option<&str>, mode: InjectionMode) -> InjectionMetadata {
        InjectionMetadata {
            injection_config: Some(InjectionConfig {
                enabled: true,
                mode,
                position: InjectionPosition::SystemReminder,
                target_sessions: vec![],
                trigger_type: Some("coordination".to_string()),
            }),
            circuit_breaker_config: Some(CircuitBreakerConfig {
                parent_request_id: parent.map(String::from),
                ..CircuitBreakerConfig::default()
            }),
            is_injection: false,
        }
    }

    #[tokio::test]
    async fn next_mode_requires_a_session() {
        let router = router();
        let result = router
            .inject(InjectionInjectParams {
                content: "note".into(),
                mode: InjectionMode::Next,
                position: InjectionPosition::BeforePrompt,
                session_id: None,
                priority: Default::default(),
                metadata: None,
            })
            .await;
        assert_eq!(result["success"], false);
        assert_eq!(result["error_type"], "no_session");
    }

    #[tokio::test]
    async fn next_mode_stores_until_taken() {
        let router = router();
        for n in 0..2 {
            let result = router
                .inject(InjectionInjectParams {
                    content: format!("note {n}"),
                    mode: InjectionMode::Next,
                    position: InjectionPosition::AfterPrompt,
                    session_id: Some("s1".into()),
                    priority: Default::default(),
                    metadata: None,
                })
                .await;
            assert_eq!(result["queued"], true);
        }

        let listed = router.list_pending(Some("s1"));
        assert_eq!(listed["sessions"][0]["count"], 2);

        let taken = router.take_pending("s1");
        assert_eq!(taken.len(), 2);
        assert!(router.take_pending("s1").is_empty());
    }

    #[tokio::test]
    async fn direct_mode_feeds_the_queue_processor() {
        let router = router();
        let rx = router.queue_receiver();
        router
            .inject(InjectionInjectParams {
                content: "go".into(),
                mode: InjectionMode::Direct,
                position: InjectionPosition::SystemReminder,
                session_id: Some("s1".into()),
                priority: Default::default(),
                metadata: None,
            })
            .await;

        let execution = rx.recv().await.unwrap().unwrap();
        assert_eq!(execution.session_id.as_deref(), Some("s1"));
        assert!(execution.content.starts_with("<system-reminder>"));
    }

    #[tokio::test]
    async fn chain_is_blocked_at_max_depth() {
        let router = router();
        let result = json!({"response": "done"});

        // Chain requests r0 <- r1 <- ... each citing the previous parent.
        let mut blocked_at = None;
        for i in 0..6 {
            let parent = if i == 0 {
                None
            } else {
                Some(format!("r{}", i - 1))
            };
            let metadata = enabled_metadata(parent.as_deref(), InjectionMode::Next);
            let outcome = router
                .process_result(&format!("r{i}"), &result, &metadata)
                .await;
            if outcome["status"] == "blocked" {
                blocked_at = Some(i);
                assert_eq!(outcome["reason"], "circuit_breaker");
                break;
            }
        }
        assert_eq!(blocked_at, Some(5), "sixth link must trip the breaker");
        assert_eq!(router.status()["blocked_count"], 1);
    }

    #[tokio::test]
    async fn injected_completions_do_not_reinject() {
        let router = router();
        let mut metadata = enabled_metadata(None, InjectionMode::Next);
        metadata.is_injection = true;
        let outcome = router
            .process_result("r1", &json!({"response": "x"}), &metadata)
            .await;
        assert_eq!(outcome["status"], "skipped");
        assert_eq!(outcome["reason"], "is_injection");
    }

    #[tokio::test]
    async fn completion_errors_skip_injection() {
        let router = router();
        let metadata = enabled_metadata(None, InjectionMode::Next);
        let outcome = router
            .process_result("r1", &json!({"error": "boom"}), &metadata)
            .await;
        assert_eq!(outcome["reason"], "completion_error");
    }

    #[tokio::test]
    async fn next_mode_process_result_stores_for_originating_session() {
        let router = router();
        let metadata = enabled_metadata(None, InjectionMode::Next);
        let outcome = router
            .process_result("r1", &json!({"response": "found 3 issues"}), &metadata)
            .await;
        assert_eq!(outcome["status"], "stored");
        assert_eq!(outcome["target_count"], 1);

        let pending = router.take_pending("originating");
        assert_eq!(pending.len(), 1);
        assert!(pending[0].content.contains("found 3 issues"));
        assert!(pending[0].content.starts_with("<system-reminder>"));
    }

    #[tokio::test]
    async fn apply_pending_places_content_by_position() {
        let router = router();
        router.store_next(
            "s1",
            "lead-in".into(),
            InjectionPosition::BeforePrompt,
            None,
            None,
        );
        router.store_next(
            "s1",
            "afterthought".into(),
            InjectionPosition::AfterPrompt,
            None,
            None,
        );
        router.store_next(
            "s1",
            "remember".into(),
            InjectionPosition::SystemReminder,
            None,
            None,
        );

        let prompt = router.apply_pending("s1", "the actual ask");
        let lead = prompt.find("lead-in").unwrap();
        let reminder = prompt.find("<system-reminder>").unwrap();
        let ask = prompt.find("the actual ask").unwrap();
        let after = prompt.find("afterthought").unwrap();
        assert!(lead < ask && reminder < ask && ask < after);

        // Untouched prompt when nothing is pending.
        assert_eq!(router.apply_pending("s2", "plain"), "plain");
    }

    #[tokio::test]
    async fn clear_removes_only_next_mode_state() {
        let router = router();
        router.store_next("s1", "x".into(), InjectionPosition::BeforePrompt, None, None);
        assert_eq!(router.clear("s1", Some(InjectionMode::Direct))["cleared"], 0);
        assert_eq!(router.clear("s1", None)["cleared"], 1);
        assert_eq!(router.clear("s1", None)["cleared"], 0);
    }

    #[tokio::test]
    async fn shutdown_sends_the_sentinel() {
        let router = router();
        let rx = router.queue_receiver();
        router.shutdown().await;
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_metadata_round_trips() {
        let router = router();
        let id = router.queue_metadata(
            Some("req-9".into()),
            Some(InjectionConfig {
                enabled: true,
                ..InjectionConfig::default()
            }),
            None,
        );
        assert_eq!(id, "req-9");
        let stored = router.metadata_for("req-9").unwrap();
        assert!(stored.injection_config.unwrap().enabled);
    }
}
