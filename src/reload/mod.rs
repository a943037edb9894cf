//! Zero-downtime hot reload.
//!
//! The running daemon spawns a successor on a shadow socket, waits for it
//! to answer `HEALTH_CHECK`, hands over the in-memory state with
//! `LOAD_STATE`, then atomically renames the shadow socket over the primary
//! path. Existing connections drain on the old socket; new ones land on the
//! successor. Any failure tears the successor down and leaves the primary
//! untouched.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use ksi_protocol::DaemonClient;

use crate::agents::AgentManager;
use crate::config::DaemonConfig;
use crate::state::SessionTracker;

/// Total time the successor has to become healthy.
const HEALTH_DEADLINE: Duration = Duration::from_secs(15);
/// Pause between health probes.
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_millis(500);
/// Socket timeout per probe and for the state transfer.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome reported to the `RELOAD_DAEMON` caller.
#[derive(Debug)]
pub enum ReloadOutcome {
    /// The successor owns the primary socket; the old daemon must shut
    /// down once the reply is flushed.
    HandedOver { transferred: Value },
    /// Something failed; the successor is gone and the primary daemon
    /// keeps running.
    RolledBack { reason: String },
}

impl ReloadOutcome {
    pub fn to_result_value(&self) -> Value {
        match self {
            ReloadOutcome::HandedOver { transferred } => json!({
                "status": "reloaded",
                "transferred": transferred,
            }),
            ReloadOutcome::RolledBack { reason } => json!({
                "status": "rollback_complete",
                "reason": reason,
            }),
        }
    }
}

/// Serialise the state the successor cannot rebuild from disk: sessions and
/// the agent registry. Identities, the KV store and the session JSONL logs
/// are authoritative on disk already.
pub fn serialize_state(sessions: &SessionTracker, agents: &AgentManager) -> Value {
    json!({
        "sessions": sessions.serialize_state(),
        "agents": agents.serialize_state(),
    })
}

/// Absorb a predecessor's `LOAD_STATE` payload. Returns per-category
/// counts.
pub fn load_state(
    sessions: &SessionTracker,
    agents: &AgentManager,
    state: &Value,
) -> Result<Value> {
    let session_count = match state.get("sessions") {
        Some(s) => sessions.load_state(s).context("failed to load sessions")?,
        None => 0,
    };
    let agent_count = match state.get("agents") {
        Some(a) => agents.load_state(a).context("failed to load agents")?,
        None => 0,
    };
    Ok(json!({
        "sessions_loaded": session_count,
        "agents_loaded": agent_count,
    }))
}

pub struct HotReloadController<'a> {
    config: &'a DaemonConfig,
    sessions: &'a SessionTracker,
    agents: &'a AgentManager,
}

impl<'a> HotReloadController<'a> {
    pub fn new(
        config: &'a DaemonConfig,
        sessions: &'a SessionTracker,
        agents: &'a AgentManager,
    ) -> Self {
        Self {
            config,
            sessions,
            agents,
        }
    }

    /// Run the whole protocol. Never returns an `Err` for a reload-level
    /// failure: those become `RolledBack`, so the caller can always reply.
    pub async fn execute(&self) -> ReloadOutcome {
        let shadow = self.config.shadow_socket_path();
        let _ = tokio::fs::remove_file(&shadow).await;

        let mut successor = match self.spawn_successor(&shadow).await {
            Ok(child) => child,
            Err(e) => {
                return ReloadOutcome::RolledBack {
                    reason: format!("failed to spawn successor: {e}"),
                }
            }
        };

        match self.bring_up(&shadow).await {
            Ok(transferred) => {
                if let Err(e) = std::fs::rename(&shadow, &self.config.socket_path) {
                    let reason = format!("socket handover failed: {e}");
                    self.roll_back(&mut successor, &shadow).await;
                    return ReloadOutcome::RolledBack { reason };
                }
                tracing::info!("hot reload complete, successor owns the primary socket");
                ReloadOutcome::HandedOver { transferred }
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(error = %reason, "hot reload failed, rolling back");
                self.roll_back(&mut successor, &shadow).await;
                ReloadOutcome::RolledBack { reason }
            }
        }
    }

    async fn spawn_successor(&self, shadow: &Path) -> Result<tokio::process::Child> {
        let exe = std::env::current_exe().context("cannot locate current executable")?;
        let child = tokio::process::Command::new(exe)
            .arg("--socket")
            .arg(shadow)
            .arg("--hot-reload-from")
            .arg(&self.config.socket_path)
            .spawn()
            .context("failed to spawn successor daemon")?;
        tracing::info!(pid = child.id(), shadow = %shadow.display(), "spawned successor");
        Ok(child)
    }

    /// Wait for health, then transfer state. Returns the transfer summary.
    async fn bring_up(&self, shadow: &Path) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + HEALTH_DEADLINE;
        let mut healthy = false;
        while tokio::time::Instant::now() < deadline {
            // Only a definitive `status=healthy` counts; a stale socket
            // from a crashed attempt fails the probe and we keep waiting.
            if DaemonClient::health_check(shadow, PROBE_TIMEOUT).await {
                healthy = true;
                break;
            }
            tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
        }
        if !healthy {
            anyhow::bail!(
                "successor did not become healthy within {}s",
                HEALTH_DEADLINE.as_secs()
            );
        }

        let state = serialize_state(self.sessions, self.agents);
        let mut client = DaemonClient::connect_with_timeout(shadow, TRANSFER_TIMEOUT)
            .await
            .context("failed to connect for state transfer")?;
        let response = client
            .request("LOAD_STATE", json!({"state_data": state}))
            .await
            .context("state transfer request failed")?;
        if !response.is_success() {
            anyhow::bail!("successor rejected LOAD_STATE: {response:?}");
        }
        Ok(response.result().cloned().unwrap_or(Value::Null))
    }

    async fn roll_back(&self, successor: &mut tokio::process::Child, shadow: &Path) {
        if let Err(e) = successor.start_kill() {
            tracing::warn!(error = %e, "failed to kill successor during rollback");
        }
        let _ = tokio::time::timeout(Duration::from_secs(3), successor.wait()).await;
        let _ = tokio::fs::remove_file(shadow).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_round_trip_preserves_counts() {
        let sessions = SessionTracker::new(None);
        sessions.track("s1", json!({"ok": 1}));
        sessions.track("s2", json!({"ok": 2}));
        let agents = AgentManager::new(None);
        agents.register("a1", "analyst", vec!["x".to_string()], None);

        let state = serialize_state(&sessions, &agents);

        let restored_sessions = SessionTracker::new(None);
        let restored_agents = AgentManager::new(None);
        let summary = load_state(&restored_sessions, &restored_agents, &state).unwrap();
        assert_eq!(summary["sessions_loaded"], 2);
        assert_eq!(summary["agents_loaded"], 1);
        assert_eq!(restored_sessions.len(), 2);
        assert!(restored_agents.contains("a1"));
    }

    #[test]
    fn partial_state_loads_what_is_present() {
        let sessions = SessionTracker::new(None);
        let agents = AgentManager::new(None);
        let summary =
            load_state(&sessions, &agents, &json!({"sessions": {"s1": {}}})).unwrap();
        assert_eq!(summary["sessions_loaded"], 1);
        assert_eq!(summary["agents_loaded"], 0);
    }

    #[test]
    fn malformed_state_is_an_error() {
        let sessions = SessionTracker::new(None);
        let agents = AgentManager::new(None);
        assert!(load_state(&sessions, &agents, &json!({"agents": "nope"})).is_err());
    }
}
