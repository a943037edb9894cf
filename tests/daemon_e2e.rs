//! End-to-end daemon tests over a real Unix socket.
//!
//! Each test wires a full `DaemonCore` into a temp directory, runs the
//! accept loop as a task, and talks to it with the protocol client exactly
//! the way agents and tools do.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use ksi::daemon::{DaemonCore, KsiDaemon};
use ksi::DaemonConfig;
use ksi_protocol::DaemonClient;

struct TestDaemon {
    core: Arc<DaemonCore>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(tweak: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default().rooted_at(dir.path());
        seed_prompts(&config.prompts_dir);
        tweak(&mut config);

        let core = DaemonCore::wire(config).unwrap();
        let daemon = KsiDaemon::bind(core.clone()).unwrap();
        tokio::spawn(async move {
            let _ = daemon.run().await;
        });

        // The accept loop is up once the socket answers.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !DaemonClient::health_check(&core.config.socket_path, Duration::from_millis(500))
            .await
        {
            assert!(
                tokio::time::Instant::now() < deadline,
                "daemon did not come up"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        Self { core, _dir: dir }
    }

    async fn client(&self) -> DaemonClient {
        DaemonClient::connect(&self.core.config.socket_path)
            .await
            .unwrap()
    }
}

fn seed_prompts(prompts_dir: &Path) {
    let write = |rel: &str, content: &str| {
        let path = prompts_dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    };
    write(
        "compositions/claude_agent_default.yaml",
        r#"
name: claude_agent_default
version: "1.0"
description: Default agent prompt
author: ksi
components:
  - name: identity
    source: components/agent_identity.md
  - name: task
    source: components/user_task.md
required_context:
  user_prompt:
    description: The task text
  role:
    default: assistant
"#,
    );
    write(
        "compositions/cyclic.yaml",
        "name: cyclic\nextends: cyclic\n",
    );
    write(
        "components/agent_identity.md",
        "You are a {{role}} agent.",
    );
    write("components/user_task.md", "## Task\n\n{{user_prompt}}");
}

fn result(response: &ksi_protocol::Response) -> &Value {
    response.result().expect("expected a success reply")
}

#[tokio::test]
async fn health_check_round_trip() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let response = client.request("HEALTH_CHECK", json!({})).await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.command(), "HEALTH_CHECK");
    let result = result(&response);
    assert_eq!(result["status"], "healthy");
    assert_eq!(result["agents"], 0);
}

#[tokio::test]
async fn unknown_and_malformed_commands_do_not_kill_the_connection() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let response = client.request("FROBNICATE", json!({})).await.unwrap();
    assert!(!response.is_success());
    match &response {
        ksi_protocol::Response::Error { error, .. } => {
            assert_eq!(error.code, ksi_protocol::ErrorCode::UnknownCommand);
        }
        _ => panic!("expected error"),
    }

    // Same connection still answers.
    let response = client.request("HEALTH_CHECK", json!({})).await.unwrap();
    assert!(response.is_success());
}

#[tokio::test]
async fn invalid_parameters_name_the_field_and_mutate_nothing() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let response = client
        .request(
            "REGISTER_AGENT",
            json!({"agent_id": "a1", "role": "analyst", "capabilitees": []}),
        )
        .await
        .unwrap();
    match &response {
        ksi_protocol::Response::Error { error, .. } => {
            assert_eq!(error.code, ksi_protocol::ErrorCode::InvalidParameters);
            assert!(error.message.contains("capabilitees"));
        }
        _ => panic!("expected INVALID_PARAMETERS"),
    }
    assert_eq!(daemon.core.agents.len(), 0);
}

#[tokio::test]
async fn register_and_route() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let response = client
        .request(
            "REGISTER_AGENT",
            json!({
                "agent_id": "a1",
                "role": "analyst",
                "capabilities": ["data_analysis", "reporting"],
            }),
        )
        .await
        .unwrap();
    assert!(response.is_success());

    let response = client
        .request(
            "ROUTE_TASK",
            json!({"task": "summarise logs", "required_capabilities": ["data_analysis"]}),
        )
        .await
        .unwrap();
    let routing = &result(&response)["routing"];
    assert_eq!(routing["status"], "routed");
    assert_eq!(routing["assigned_agent"]["id"], "a1");
    assert_eq!(routing["match_score"], 1);
}

#[tokio::test]
async fn subscribe_and_publish_across_connections() {
    let daemon = TestDaemon::start().await;

    // Connection X: persistent agent channel plus subscription.
    let mut agent_conn = daemon.client().await;
    let response = agent_conn
        .request(
            "AGENT_CONNECTION",
            json!({"action": "connect", "agent_id": "a2"}),
        )
        .await
        .unwrap();
    assert!(response.is_success());
    let response = agent_conn
        .request(
            "SUBSCRIBE",
            json!({"agent_id": "a2", "event_types": ["BROADCAST"]}),
        )
        .await
        .unwrap();
    assert!(response.is_success());

    // Connection Y publishes.
    let mut publisher = daemon.client().await;
    let response = publisher
        .request(
            "PUBLISH",
            json!({
                "from_agent": "a3",
                "event_type": "BROADCAST",
                "payload": {"message": "hi"},
            }),
        )
        .await
        .unwrap();
    assert_eq!(result(&response)["publish"]["delivered"], json!(["a2"]));

    // X receives exactly one event frame, distinguishable from replies.
    let event = agent_conn.next_event(Duration::from_secs(2)).await.unwrap();
    assert_eq!(event["type"], "BROADCAST");
    assert_eq!(event["from"], "a3");
    assert_eq!(event["message"], "hi");
    assert!(event.get("status").is_none());

    assert!(agent_conn
        .next_event(Duration::from_millis(200))
        .await
        .is_err());
}

#[tokio::test]
async fn subscribe_without_connection_is_rejected() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;
    let response = client
        .request(
            "SUBSCRIBE",
            json!({"agent_id": "ghost", "event_types": ["BROADCAST"]}),
        )
        .await
        .unwrap();
    match &response {
        ksi_protocol::Response::Error { error, .. } => {
            assert_eq!(error.code, ksi_protocol::ErrorCode::AgentNotConnected);
        }
        _ => panic!("expected AGENT_NOT_CONNECTED"),
    }
}

#[tokio::test]
async fn offline_direct_message_is_delivered_on_reconnect() {
    let daemon = TestDaemon::start().await;
    let mut sender = daemon.client().await;

    sender
        .request(
            "REGISTER_AGENT",
            json!({"agent_id": "a1", "role": "analyst", "capabilities": []}),
        )
        .await
        .unwrap();
    sender
        .request(
            "REGISTER_AGENT",
            json!({"agent_id": "a2", "role": "analyst", "capabilities": []}),
        )
        .await
        .unwrap();

    let response = sender
        .request(
            "SEND_MESSAGE",
            json!({
                "from_agent": "a1",
                "to_agent": "a2",
                "message_type": "DIRECT_MESSAGE",
                "content": {"text": "ping"},
            }),
        )
        .await
        .unwrap();
    assert_eq!(result(&response)["delivery"]["status"], "queued");

    // a2 connects; the queued message is drained onto its channel.
    let mut receiver = daemon.client().await;
    receiver
        .request(
            "AGENT_CONNECTION",
            json!({"action": "connect", "agent_id": "a2"}),
        )
        .await
        .unwrap();
    let event = receiver.next_event(Duration::from_secs(2)).await.unwrap();
    assert_eq!(event["type"], "DIRECT_MESSAGE");
    assert_eq!(event["content"]["text"], "ping");
}

#[tokio::test]
async fn kv_round_trip_with_namespace_listing() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let response = client
        .request(
            "SET_AGENT_KV",
            json!({
                "key": "analyst.findings.latest",
                "value": {"rows": 3},
                "owner_agent_id": "a1",
                "scope": "coordination",
            }),
        )
        .await
        .unwrap();
    assert_eq!(
        result(&response)["stored"]["namespace"],
        "analyst.findings"
    );

    let response = client
        .request("GET_AGENT_KV", json!({"key": "analyst.findings.latest"}))
        .await
        .unwrap();
    assert_eq!(result(&response)["found"], true);
    assert_eq!(result(&response)["entry"]["value"]["rows"], 3);

    let response = client
        .request("GET_AGENT_KV", json!({"namespace": "analyst.findings"}))
        .await
        .unwrap();
    assert_eq!(result(&response)["count"], 1);
}

#[tokio::test]
async fn compose_prompt_with_defaults_and_cycle_validation() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let response = client
        .request(
            "COMPOSE_PROMPT",
            json!({"composition": "claude_agent_default", "context": {"user_prompt": "x"}}),
        )
        .await
        .unwrap();
    assert!(response.is_success());
    let prompt = result(&response)["prompt"].as_str().unwrap();
    assert!(!prompt.is_empty());
    assert!(prompt.contains("assistant"));
    assert_eq!(result(&response)["warnings"], json!([]));

    let response = client
        .request("VALIDATE_COMPOSITION", json!({"name": "cyclic", "context": {}}))
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(result(&response)["valid"], false);
    let issues = result(&response)["issues"].as_array().unwrap();
    assert!(issues[0]["message"].as_str().unwrap().contains("cyclic"));
}

#[tokio::test]
async fn injection_chain_blocks_at_depth() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let mut blocked_at = None;
    for i in 0..6 {
        let parent = if i == 0 {
            Value::Null
        } else {
            json!(format!("r{}", i - 1))
        };
        let response = client
            .request(
                "INJECTION_PROCESS_RESULT",
                json!({
                    "request_id": format!("r{i}"),
                    "result": {"response": "done"},
                    "injection_metadata": {
                        "injection_config": {"enabled": true, "mode": "next"},
                        "circuit_breaker_config": {"parent_request_id": parent},
                    },
                }),
            )
            .await
            .unwrap();
        let status = result(&response)["status"].as_str().unwrap().to_string();
        if status == "blocked" {
            assert_eq!(result(&response)["reason"], "circuit_breaker");
            blocked_at = Some(i);
            break;
        }
        assert_eq!(status, "stored");
    }
    assert_eq!(blocked_at, Some(5), "the sixth injection must be blocked");
}

#[tokio::test]
async fn load_state_restores_sessions_and_agents() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let state = json!({
        "sessions": {"s1": {"ok": 1}, "s2": {"ok": 2}},
        "agents": [{
            "agent_id": "a9",
            "role": "analyst",
            "capabilities": ["x"],
            "status": "inactive",
            "model": "sonnet",
            "created_at": "2026-01-01T00:00:00Z",
            "last_active": "2026-01-01T00:00:00Z",
            "sessions": [],
        }],
    });
    let response = client
        .request("LOAD_STATE", json!({"state_data": state}))
        .await
        .unwrap();
    assert_eq!(result(&response)["sessions_loaded"], 2);
    assert_eq!(result(&response)["agents_loaded"], 1);

    let response = client.request("GET_AGENTS", json!({})).await.unwrap();
    assert_eq!(result(&response)["count"], 1);
    assert_eq!(result(&response)["agents"][0]["agent_id"], "a9");

    let response = client.request("GET_PROCESSES", json!({})).await.unwrap();
    assert_eq!(result(&response)["count"], 0);
}

#[tokio::test]
async fn get_commands_describes_the_full_surface() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let response = client.request("GET_COMMANDS", json!({})).await.unwrap();
    let commands = result(&response)["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 38);
    assert_eq!(result(&response)["aliases"]["SPAWN"], "COMPLETION");
}

#[tokio::test]
async fn spawn_alias_hits_the_completion_handler() {
    let daemon = TestDaemon::start_with(|config| {
        config.llm.program = "ksi-test-missing-llm".to_string();
    })
    .await;
    let mut client = daemon.client().await;

    // No real LLM binary in tests: a sync SPAWN against a missing program
    // must still answer on the SPAWN name with a structured result.
    let response = client
        .request(
            "SPAWN",
            json!({"prompt": "hello", "model": "sonnet"}),
        )
        .await
        .unwrap();
    assert_eq!(response.command(), "SPAWN");
    assert!(response.is_success());
    let error = result(&response)["response"]["error"].as_str().unwrap();
    assert!(error.contains("not found"), "unexpected: {error}");
}

#[tokio::test]
async fn shutdown_replies_then_stops_accepting() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let response = client.request("SHUTDOWN", json!({})).await.unwrap();
    assert_eq!(result(&response)["status"], "shutting_down");

    // The daemon removes its socket on the way out.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while daemon.core.config.socket_path.exists() {
        assert!(tokio::time::Instant::now() < deadline, "socket not removed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn metadata_with_unknown_keys_is_rejected() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    // Hand-built envelope with a spoofed metadata key; bypasses the client
    // helper on purpose.
    let response = client
        .request_raw(json!({
            "command": "HEALTH_CHECK",
            "version": "2.0",
            "parameters": {},
            "metadata": {"timestamp": "2026-01-01T00:00:00Z", "spoofed": true},
        }))
        .await
        .unwrap();
    match &response {
        ksi_protocol::Response::Error { error, .. } => {
            assert_eq!(error.code, ksi_protocol::ErrorCode::InvalidCommand);
        }
        _ => panic!("expected INVALID_COMMAND"),
    }
}
