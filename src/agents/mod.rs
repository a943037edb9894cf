//! Agent registry and capability-based task routing.
//!
//! Agents are external worker processes; this registry tracks who exists,
//! what they can do, and whether their supervised child is alive. Routing
//! scores candidates by capability intersection and appends every decision
//! to a JSONL log for later analysis.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Busy,
    Inactive,
}

/// One registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub role: String,
    pub capabilities: HashSet<String>,
    pub status: AgentStatus,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    /// Composition or profile the worker's system prompt came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_context: Option<Value>,
    pub created_at: String,
    pub last_active: String,
    /// Append-only list of LLM sessions this agent has touched.
    pub sessions: Vec<String>,
}

/// Outcome of `ROUTE_TASK`, before the assignment event is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoutingDecision {
    Routed {
        assigned_agent: AssignedAgent,
        match_score: usize,
    },
    NoSuitableAgent {
        required_capabilities: Vec<String>,
    },
    NoAvailableAgent {
        candidates: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedAgent {
    pub id: String,
    pub role: String,
}

pub struct AgentManager {
    agents: DashMap<String, AgentInfo>,
    routing_log_path: Option<PathBuf>,
}

impl AgentManager {
    pub fn new(routing_log_path: Option<PathBuf>) -> Self {
        Self {
            agents: DashMap::new(),
            routing_log_path,
        }
    }

    /// Register a manually-managed agent. Registering an existing id
    /// refreshes role and capabilities but keeps its history.
    pub fn register(
        &self,
        agent_id: &str,
        role: &str,
        capabilities: Vec<String>,
        model: Option<String>,
    ) -> AgentInfo {
        let now = ksi_protocol::timestamp_utc();
        let mut entry = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentInfo {
                agent_id: agent_id.to_string(),
                role: role.to_string(),
                capabilities: HashSet::new(),
                status: AgentStatus::Active,
                model: model.clone().unwrap_or_else(|| "sonnet".to_string()),
                process_id: None,
                profile: None,
                initial_task: None,
                initial_context: None,
                created_at: now.clone(),
                last_active: now.clone(),
                sessions: Vec::new(),
            });
        entry.role = role.to_string();
        entry.capabilities = capabilities.into_iter().collect();
        if let Some(model) = model {
            entry.model = model;
        }
        entry.status = AgentStatus::Active;
        entry.last_active = now;
        entry.clone()
    }

    /// Record a spawned worker agent.
    #[allow(clippy::too_many_arguments)]
    pub fn register_spawned(
        &self,
        agent_id: &str,
        role: &str,
        capabilities: Vec<String>,
        model: String,
        process_id: String,
        profile: Option<String>,
        initial_task: String,
        initial_context: Option<Value>,
    ) -> AgentInfo {
        let now = ksi_protocol::timestamp_utc();
        let info = AgentInfo {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            capabilities: capabilities.into_iter().collect(),
            status: AgentStatus::Active,
            model,
            process_id: Some(process_id),
            profile,
            initial_task: Some(initial_task),
            initial_context,
            created_at: now.clone(),
            last_active: now,
            sessions: Vec::new(),
        };
        self.agents.insert(agent_id.to_string(), info.clone());
        info
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        let mut all: Vec<AgentInfo> = self.agents.iter().map(|a| a.clone()).collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn remove(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.remove(agent_id).map(|(_, info)| info)
    }

    pub fn set_status(&self, agent_id: &str, status: AgentStatus) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            agent.status = status;
            agent.last_active = ksi_protocol::timestamp_utc();
        }
    }

    /// Append a session id to an agent's history and refresh activity.
    pub fn record_session(&self, agent_id: &str, session_id: &str) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            if !agent.sessions.iter().any(|s| s == session_id) {
                agent.sessions.push(session_id.to_string());
            }
            agent.last_active = ksi_protocol::timestamp_utc();
        }
    }

    pub fn touch(&self, agent_id: &str) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            agent.last_active = ksi_protocol::timestamp_utc();
        }
    }

    /// Choose an agent for a task.
    ///
    /// Score is the size of the capability intersection; ties go to the
    /// agent idle longest. `prefer_agent_id` wins whenever that agent is
    /// active and matches at least one capability.
    pub fn route_task(
        &self,
        task: &str,
        required_capabilities: &[String],
        prefer_agent_id: Option<&str>,
    ) -> RoutingDecision {
        let required: HashSet<&str> = required_capabilities.iter().map(String::as_str).collect();

        let mut candidates: Vec<(AgentInfo, usize)> = self
            .agents
            .iter()
            .filter_map(|agent| {
                let score = agent
                    .capabilities
                    .iter()
                    .filter(|c| required.contains(c.as_str()))
                    .count();
                (score > 0).then(|| (agent.clone(), score))
            })
            .collect();

        if candidates.is_empty() {
            let decision = RoutingDecision::NoSuitableAgent {
                required_capabilities: required_capabilities.to_vec(),
            };
            self.log_routing(task, required_capabilities, &decision);
            return decision;
        }

        let mut active: Vec<(AgentInfo, usize)> = candidates
            .drain(..)
            .filter(|(agent, _)| agent.status == AgentStatus::Active)
            .collect();

        if active.is_empty() {
            let decision = RoutingDecision::NoAvailableAgent {
                candidates: {
                    let mut ids: Vec<String> = self
                        .agents
                        .iter()
                        .filter(|a| {
                            a.capabilities
                                .iter()
                                .any(|c| required.contains(c.as_str()))
                        })
                        .map(|a| a.agent_id.clone())
                        .collect();
                    ids.sort();
                    ids
                },
            };
            self.log_routing(task, required_capabilities, &decision);
            return decision;
        }

        let preferred = prefer_agent_id.and_then(|id| {
            active
                .iter()
                .find(|(agent, _)| agent.agent_id == id)
                .cloned()
        });

        let (chosen, score) = preferred.unwrap_or_else(|| {
            // Highest score wins; earliest last_active breaks ties.
            active.sort_by(|(a, sa), (b, sb)| {
                sb.cmp(sa).then_with(|| a.last_active.cmp(&b.last_active))
            });
            active.remove(0)
        });

        let decision = RoutingDecision::Routed {
            assigned_agent: AssignedAgent {
                id: chosen.agent_id.clone(),
                role: chosen.role.clone(),
            },
            match_score: score,
        };
        self.log_routing(task, required_capabilities, &decision);
        decision
    }

    fn log_routing(&self, task: &str, required: &[String], decision: &RoutingDecision) {
        let Some(path) = &self.routing_log_path else {
            return;
        };
        let record = json!({
            "timestamp": ksi_protocol::timestamp_utc(),
            "task": task,
            "required_capabilities": required,
            "decision": decision,
        });
        if let Err(e) = append_jsonl(path, &record) {
            tracing::error!(error = %e, "failed to append routing log");
        }
    }

    /// Serialise for hot-reload transfer. Process ids are dropped: children
    /// do not survive the handover.
    pub fn serialize_state(&self) -> Value {
        let agents: Vec<Value> = self
            .list()
            .into_iter()
            .map(|mut info| {
                info.process_id = None;
                info.status = AgentStatus::Inactive;
                serde_json::to_value(info).unwrap_or(Value::Null)
            })
            .collect();
        Value::Array(agents)
    }

    pub fn load_state(&self, state: &Value) -> Result<usize> {
        let agents = state.as_array().context("agents state must be an array")?;
        let mut loaded = 0usize;
        for raw in agents {
            let info: AgentInfo = serde_json::from_value(raw.clone())
                .context("malformed agent in transferred state")?;
            self.agents.insert(info.agent_id.clone(), info);
            loaded += 1;
        }
        Ok(loaded)
    }
}

fn append_jsonl(path: &PathBuf, record: &Value) -> Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{record}")?;
    Ok(())
}
