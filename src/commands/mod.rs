//! Command handlers and the static command table.
//!
//! The dispatcher resolves a wire name to a `CommandName`, binds request
//! context, and hands the raw parameters to the matching handler here.
//! Handlers parse their typed parameter struct (strict, unknown keys
//! rejected), talk to the managers on `DaemonCore`, and return either a
//! result value or a `CommandError` carrying a stable wire code.

pub mod admin;
pub mod agents;
pub mod completion;
pub mod composition;
pub mod identity;
pub mod injection;
pub mod messaging;
pub mod state;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use ksi_protocol::error::CommandError;
use ksi_protocol::CommandName;

use crate::daemon::{ConnectionCtx, DaemonCore};
use crate::logging::Domain;

/// Static description of one command, served by `GET_COMMANDS`.
pub struct CommandDescriptor {
    pub name: CommandName,
    pub domain: Domain,
    pub summary: &'static str,
    pub parameters: &'static str,
}

/// The command table. Registration is static: every command the daemon
/// understands is listed here, plus the legacy `SPAWN` alias resolved in
/// `CommandName::from_wire`.
pub const DESCRIPTORS: &[CommandDescriptor] = &[
    CommandDescriptor {
        name: CommandName::HealthCheck,
        domain: Domain::Admin,
        summary: "Liveness probe; reports uptime and registry counts",
        parameters: "(none)",
    },
    CommandDescriptor {
        name: CommandName::Shutdown,
        domain: Domain::Admin,
        summary: "Begin graceful shutdown",
        parameters: "(none)",
    },
    CommandDescriptor {
        name: CommandName::ReloadDaemon,
        domain: Domain::Admin,
        summary: "Hot-reload into a fresh daemon without dropping the socket",
        parameters: "(none)",
    },
    CommandDescriptor {
        name: CommandName::LoadState,
        domain: Domain::Admin,
        summary: "Accept serialised state from a predecessor daemon",
        parameters: "state_data",
    },
    CommandDescriptor {
        name: CommandName::Cleanup,
        domain: Domain::Admin,
        summary: "Purge logs, sessions or stale sockets",
        parameters: "cleanup_type: logs|sessions|sockets|all",
    },
    CommandDescriptor {
        name: CommandName::ReloadModule,
        domain: Domain::Admin,
        summary: "Load or refresh an extension module manifest",
        parameters: "module_name",
    },
    CommandDescriptor {
        name: CommandName::Completion,
        domain: Domain::Completion,
        summary: "Invoke the LLM, sync or async (legacy alias: SPAWN)",
        parameters: "mode?, prompt, session_id?, model?, agent_id?, enable_tools?",
    },
    CommandDescriptor {
        name: CommandName::GetProcesses,
        domain: Domain::Completion,
        summary: "List supervised child processes",
        parameters: "(none)",
    },
    CommandDescriptor {
        name: CommandName::RegisterAgent,
        domain: Domain::Agents,
        summary: "Register a manually-managed agent",
        parameters: "agent_id, role, capabilities[]",
    },
    CommandDescriptor {
        name: CommandName::SpawnAgent,
        domain: Domain::Agents,
        summary: "Spawn an agent worker process with an initial task",
        parameters: "task, profile_name?, agent_id?, role?, capabilities[]?, context?",
    },
    CommandDescriptor {
        name: CommandName::GetAgents,
        domain: Domain::Agents,
        summary: "List registered agents",
        parameters: "(none)",
    },
    CommandDescriptor {
        name: CommandName::RouteTask,
        domain: Domain::Agents,
        summary: "Assign a task to the best capability match",
        parameters: "task, required_capabilities[], context?, prefer_agent_id?",
    },
    CommandDescriptor {
        name: CommandName::SendMessage,
        domain: Domain::Messaging,
        summary: "Send an agent-to-agent message",
        parameters: "from_agent, to_agent?, message_type, content, metadata?",
    },
    CommandDescriptor {
        name: CommandName::Publish,
        domain: Domain::Messaging,
        summary: "Publish an event to subscribers",
        parameters: "from_agent, event_type, payload",
    },
    CommandDescriptor {
        name: CommandName::Subscribe,
        domain: Domain::Messaging,
        summary: "Subscribe a connected agent to event types",
        parameters: "agent_id, event_types[]",
    },
    CommandDescriptor {
        name: CommandName::AgentConnection,
        domain: Domain::Messaging,
        summary: "Open or close the persistent delivery channel",
        parameters: "action: connect|disconnect, agent_id",
    },
    CommandDescriptor {
        name: CommandName::MessageBusStats,
        domain: Domain::Messaging,
        summary: "Message bus diagnostics",
        parameters: "(none)",
    },
    CommandDescriptor {
        name: CommandName::SetAgentKv,
        domain: Domain::State,
        summary: "Write a shared key-value entry",
        parameters: "key, value, owner_agent_id?, scope?, expires_at?, metadata?",
    },
    CommandDescriptor {
        name: CommandName::GetAgentKv,
        domain: Domain::State,
        summary: "Read one entry, or list by namespace/owner",
        parameters: "key?, namespace?, owner_agent_id?",
    },
    CommandDescriptor {
        name: CommandName::CreateIdentity,
        domain: Domain::State,
        summary: "Create an agent identity with role defaults",
        parameters: "agent_id, display_name?, role?, personality_traits[]?, appearance?",
    },
    CommandDescriptor {
        name: CommandName::UpdateIdentity,
        domain: Domain::State,
        summary: "Merge updates into an identity (protected fields rejected)",
        parameters: "agent_id, updates",
    },
    CommandDescriptor {
        name: CommandName::GetIdentity,
        domain: Domain::State,
        summary: "Fetch one identity",
        parameters: "agent_id",
    },
    CommandDescriptor {
        name: CommandName::ListIdentities,
        domain: Domain::State,
        summary: "List all identities",
        parameters: "(none)",
    },
    CommandDescriptor {
        name: CommandName::RemoveIdentity,
        domain: Domain::State,
        summary: "Delete an identity",
        parameters: "agent_id",
    },
    CommandDescriptor {
        name: CommandName::GetCompositions,
        domain: Domain::Completion,
        summary: "List available prompt compositions",
        parameters: "include_metadata?",
    },
    CommandDescriptor {
        name: CommandName::GetComposition,
        domain: Domain::Completion,
        summary: "Fetch one composition recipe",
        parameters: "name, include_metadata?",
    },
    CommandDescriptor {
        name: CommandName::ValidateComposition,
        domain: Domain::Completion,
        summary: "Check a composition's graph and required context",
        parameters: "name, context?",
    },
    CommandDescriptor {
        name: CommandName::ComposePrompt,
        domain: Domain::Completion,
        summary: "Render a composition into a prompt",
        parameters: "composition, context?",
    },
    CommandDescriptor {
        name: CommandName::ListComponents,
        domain: Domain::Completion,
        summary: "Inventory the prompt component tree",
        parameters: "directory?",
    },
    CommandDescriptor {
        name: CommandName::InjectionInject,
        domain: Domain::Completion,
        summary: "Queue or store a prompt injection",
        parameters: "content, mode?, position?, session_id?, priority?, metadata?",
    },
    CommandDescriptor {
        name: CommandName::InjectionBatch,
        domain: Domain::Completion,
        summary: "Queue several injections in order",
        parameters: "injections[]",
    },
    CommandDescriptor {
        name: CommandName::InjectionList,
        domain: Domain::Completion,
        summary: "List pending next-mode injections",
        parameters: "session_id?",
    },
    CommandDescriptor {
        name: CommandName::InjectionClear,
        domain: Domain::Completion,
        summary: "Clear pending injections for a session",
        parameters: "session_id, mode?",
    },
    CommandDescriptor {
        name: CommandName::InjectionQueue,
        domain: Domain::Completion,
        summary: "Register injection metadata for an in-flight completion",
        parameters: "id?, injection_config?, circuit_breaker_config?",
    },
    CommandDescriptor {
        name: CommandName::InjectionStatus,
        domain: Domain::Completion,
        summary: "Injection router and circuit breaker status",
        parameters: "parent_request_id?",
    },
    CommandDescriptor {
        name: CommandName::InjectionProcessResult,
        domain: Domain::Completion,
        summary: "Fold a completion result back into the injection loop",
        parameters: "request_id, result, injection_metadata",
    },
    CommandDescriptor {
        name: CommandName::InjectionExecute,
        domain: Domain::Completion,
        summary: "Execute stored injection content as a fresh completion",
        parameters: "content, agent_id, request_id?, model?, priority?, injection_type?",
    },
    CommandDescriptor {
        name: CommandName::GetCommands,
        domain: Domain::Admin,
        summary: "Describe every registered command",
        parameters: "(none)",
    },
];

pub fn descriptor(name: CommandName) -> Option<&'static CommandDescriptor> {
    DESCRIPTORS.iter().find(|d| d.name == name)
}

/// The functional domain a command is logged under.
pub fn domain_of(name: CommandName) -> Domain {
    descriptor(name).map(|d| d.domain).unwrap_or(Domain::Admin)
}

/// Parse a command's parameters into its typed struct. serde gives the
/// field-path diagnostics (`missing field`, `unknown field`, type errors)
/// that `INVALID_PARAMETERS` replies carry.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, CommandError> {
    serde_json::from_value(params).map_err(|e| CommandError::invalid_parameters(e.to_string()))
}

/// Route a validated command to its handler.
pub async fn dispatch(
    core: &Arc<DaemonCore>,
    conn: &mut ConnectionCtx,
    name: CommandName,
    params: Value,
) -> Result<Value, CommandError> {
    match name {
        CommandName::HealthCheck => admin::health_check(core, params),
        CommandName::Shutdown => admin::shutdown(core, conn, params),
        CommandName::ReloadDaemon => admin::reload_daemon(core, conn, params).await,
        CommandName::LoadState => admin::load_state(core, params),
        CommandName::Cleanup => admin::cleanup(core, params).await,
        CommandName::ReloadModule => admin::reload_module(core, params),
        CommandName::GetCommands => admin::get_commands(params),

        CommandName::Completion => completion::completion(core, params).await,
        CommandName::GetProcesses => completion::get_processes(core, params),

        CommandName::RegisterAgent => agents::register_agent(core, params),
        CommandName::SpawnAgent => agents::spawn_agent(core, params).await,
        CommandName::GetAgents => agents::get_agents(core, params),
        CommandName::RouteTask => agents::route_task(core, params).await,

        CommandName::SendMessage => messaging::send_message(core, params).await,
        CommandName::Publish => messaging::publish(core, params).await,
        CommandName::Subscribe => messaging::subscribe(core, params).await,
        CommandName::AgentConnection => messaging::agent_connection(core, conn, params).await,
        CommandName::MessageBusStats => messaging::message_bus_stats(core, params).await,

        CommandName::SetAgentKv => state::set_agent_kv(core, params).await,
        CommandName::GetAgentKv => state::get_agent_kv(core, params).await,

        CommandName::CreateIdentity => identity::create_identity(core, params).await,
        CommandName::UpdateIdentity => identity::update_identity(core, params).await,
        CommandName::GetIdentity => identity::get_identity(core, params).await,
        CommandName::ListIdentities => identity::list_identities(core, params).await,
        CommandName::RemoveIdentity => identity::remove_identity(core, params).await,

        CommandName::GetCompositions => composition::get_compositions(core, params),
        CommandName::GetComposition => composition::get_composition(core, params),
        CommandName::ValidateComposition => composition::validate_composition(core, params),
        CommandName::ComposePrompt => composition::compose_prompt(core, params),
        CommandName::ListComponents => composition::list_components(core, params),

        CommandName::InjectionInject => injection::inject(core, params).await,
        CommandName::InjectionBatch => injection::inject_batch(core, params).await,
        CommandName::InjectionList => injection::list(core, params),
        CommandName::InjectionClear => injection::clear(core, params),
        CommandName::InjectionQueue => injection::queue(core, params),
        CommandName::InjectionStatus => injection::status(core, params),
        CommandName::InjectionProcessResult => injection::process_result(core, params).await,
        CommandName::InjectionExecute => injection::execute(core, params).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_has_exactly_one_descriptor() {
        for &name in CommandName::ALL {
            let count = DESCRIPTORS.iter().filter(|d| d.name == name).count();
            assert_eq!(count, 1, "{name} must appear once in the table");
        }
        assert_eq!(DESCRIPTORS.len(), CommandName::ALL.len());
    }

    #[test]
    fn parse_params_reports_the_offending_field() {
        use ksi_protocol::commands::RegisterAgentParams;
        let err = parse_params::<RegisterAgentParams>(serde_json::json!({
            "agent_id": "a1", "role": "x", "capabilitees": []
        }))
        .unwrap_err();
        assert_eq!(err.code, ksi_protocol::ErrorCode::InvalidParameters);
        assert!(err.message.contains("capabilitees"));
    }
}
