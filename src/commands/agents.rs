//! Agent-domain handlers: registration, worker spawning, listing and
//! capability-matched task routing.

use std::sync::Arc;

use serde_json::{json, Value};

use ksi_protocol::commands::{
    GetAgentsParams, RegisterAgentParams, RouteTaskParams, SpawnAgentParams,
};
use ksi_protocol::error::CommandError;
use ksi_protocol::ErrorCode;

use super::parse_params;
use crate::agents::RoutingDecision;
use crate::composer::ComposerError;
use crate::daemon::{worker_exit_handler, DaemonCore};

pub fn register_agent(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: RegisterAgentParams = parse_params(params)?;
    let info = core.agents.register(
        &params.agent_id,
        &params.role,
        params.capabilities,
        params.model,
    );
    tracing::info!(agent_id = %info.agent_id, role = %info.role, "registered agent");
    Ok(json!({"agent": info}))
}

pub fn get_agents(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let _: GetAgentsParams = parse_params(params)?;
    let agents = core.agents.list();
    Ok(json!({"count": agents.len(), "agents": agents}))
}

pub async fn spawn_agent(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: SpawnAgentParams = parse_params(params)?;
    let agent_id = params
        .agent_id
        .unwrap_or_else(|| format!("agent_{}", uuid::Uuid::new_v4()));
    let role = params.role.unwrap_or_else(|| "general".to_string());
    let capabilities = params.capabilities.unwrap_or_default();
    let profile = params
        .profile_name
        .unwrap_or_else(|| "claude_agent_default".to_string());

    // The system prompt comes from the named composition; a profile that
    // is not on disk falls back to a minimal role prompt rather than
    // failing the spawn.
    let context = json!({
        "agent_id": agent_id.clone(),
        "role": role.clone(),
        "capabilities": capabilities.clone(),
        "user_prompt": params.task.clone(),
        "enable_tools": true,
    });
    let system_prompt = match core.composer.compose(&profile, &context) {
        Ok(prompt) => prompt,
        Err(e @ ComposerError::CompositionNotFound { .. }) => {
            tracing::warn!(profile = %profile, error = %e, "composition missing, using fallback profile");
            format!("You are the {role} agent `{agent_id}`.\n\nYour task:\n{}", params.task)
        }
        Err(e) => {
            return Err(CommandError::new(
                ErrorCode::CompositionFailed,
                format!("failed to compose profile {profile}: {e}"),
            ))
        }
    };

    let on_exit = worker_exit_handler(core.bus.clone(), core.agents.clone());
    let info = core
        .supervisor
        .spawn_agent_worker(
            &core.config.worker_program,
            &agent_id,
            &core.config.socket_path,
            &system_prompt,
            &params.task,
            params.context.as_ref(),
            on_exit,
        )
        .await
        .map_err(|e| CommandError::new(ErrorCode::SpawnFailed, e.to_string()))?;

    let agent = core.agents.register_spawned(
        &agent_id,
        &role,
        capabilities,
        core.config.llm.default_model.clone(),
        info.process_id.clone(),
        Some(profile),
        params.task,
        params.context,
    );
    tracing::info!(agent_id = %agent_id, process_id = %info.process_id, "spawned agent worker");
    Ok(json!({"agent": agent, "process": info}))
}

pub async fn route_task(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: RouteTaskParams = parse_params(params)?;
    let decision = core.agents.route_task(
        &params.task,
        &params.required_capabilities,
        params.prefer_agent_id.as_deref(),
    );

    if let RoutingDecision::Routed { assigned_agent, .. } = &decision {
        let payload = json!({
            "to": assigned_agent.id,
            "task": params.task,
            "required_capabilities": params.required_capabilities,
            "context": params.context,
        });
        core.bus
            .publish("daemon", "TASK_ASSIGNMENT", &payload)
            .await;
        core.agents.touch(&assigned_agent.id);
    }

    Ok(json!({"routing": decision}))
}
