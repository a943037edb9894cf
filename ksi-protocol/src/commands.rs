//! Typed parameters for every daemon command.
//!
//! One strict struct per command; unknown keys are rejected so a typo in a
//! client never silently changes meaning. `SPAWN` is a deprecated alias of
//! `COMPLETION` and validates against the same struct.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every command the daemon dispatches, by canonical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandName {
    HealthCheck,
    Shutdown,
    ReloadDaemon,
    LoadState,
    Cleanup,
    ReloadModule,
    Completion,
    GetProcesses,
    RegisterAgent,
    SpawnAgent,
    GetAgents,
    RouteTask,
    SendMessage,
    Publish,
    Subscribe,
    AgentConnection,
    MessageBusStats,
    SetAgentKv,
    GetAgentKv,
    CreateIdentity,
    UpdateIdentity,
    GetIdentity,
    ListIdentities,
    RemoveIdentity,
    GetCompositions,
    GetComposition,
    ValidateComposition,
    ComposePrompt,
    ListComponents,
    InjectionInject,
    InjectionBatch,
    InjectionList,
    InjectionClear,
    InjectionQueue,
    InjectionStatus,
    InjectionProcessResult,
    InjectionExecute,
    GetCommands,
}

impl CommandName {
    pub const ALL: &'static [CommandName] = &[
        CommandName::HealthCheck,
        CommandName::Shutdown,
        CommandName::ReloadDaemon,
        CommandName::LoadState,
        CommandName::Cleanup,
        CommandName::ReloadModule,
        CommandName::Completion,
        CommandName::GetProcesses,
        CommandName::RegisterAgent,
        CommandName::SpawnAgent,
        CommandName::GetAgents,
        CommandName::RouteTask,
        CommandName::SendMessage,
        CommandName::Publish,
        CommandName::Subscribe,
        CommandName::AgentConnection,
        CommandName::MessageBusStats,
        CommandName::SetAgentKv,
        CommandName::GetAgentKv,
        CommandName::CreateIdentity,
        CommandName::UpdateIdentity,
        CommandName::GetIdentity,
        CommandName::ListIdentities,
        CommandName::RemoveIdentity,
        CommandName::GetCompositions,
        CommandName::GetComposition,
        CommandName::ValidateComposition,
        CommandName::ComposePrompt,
        CommandName::ListComponents,
        CommandName::InjectionInject,
        CommandName::InjectionBatch,
        CommandName::InjectionList,
        CommandName::InjectionClear,
        CommandName::InjectionQueue,
        CommandName::InjectionStatus,
        CommandName::InjectionProcessResult,
        CommandName::InjectionExecute,
        CommandName::GetCommands,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::HealthCheck => "HEALTH_CHECK",
            CommandName::Shutdown => "SHUTDOWN",
            CommandName::ReloadDaemon => "RELOAD_DAEMON",
            CommandName::LoadState => "LOAD_STATE",
            CommandName::Cleanup => "CLEANUP",
            CommandName::ReloadModule => "RELOAD_MODULE",
            CommandName::Completion => "COMPLETION",
            CommandName::GetProcesses => "GET_PROCESSES",
            CommandName::RegisterAgent => "REGISTER_AGENT",
            CommandName::SpawnAgent => "SPAWN_AGENT",
            CommandName::GetAgents => "GET_AGENTS",
            CommandName::RouteTask => "ROUTE_TASK",
            CommandName::SendMessage => "SEND_MESSAGE",
            CommandName::Publish => "PUBLISH",
            CommandName::Subscribe => "SUBSCRIBE",
            CommandName::AgentConnection => "AGENT_CONNECTION",
            CommandName::MessageBusStats => "MESSAGE_BUS_STATS",
            CommandName::SetAgentKv => "SET_AGENT_KV",
            CommandName::GetAgentKv => "GET_AGENT_KV",
            CommandName::CreateIdentity => "CREATE_IDENTITY",
            CommandName::UpdateIdentity => "UPDATE_IDENTITY",
            CommandName::GetIdentity => "GET_IDENTITY",
            CommandName::ListIdentities => "LIST_IDENTITIES",
            CommandName::RemoveIdentity => "REMOVE_IDENTITY",
            CommandName::GetCompositions => "GET_COMPOSITIONS",
            CommandName::GetComposition => "GET_COMPOSITION",
            CommandName::ValidateComposition => "VALIDATE_COMPOSITION",
            CommandName::ComposePrompt => "COMPOSE_PROMPT",
            CommandName::ListComponents => "LIST_COMPONENTS",
            CommandName::InjectionInject => "INJECTION_INJECT",
            CommandName::InjectionBatch => "INJECTION_BATCH",
            CommandName::InjectionList => "INJECTION_LIST",
            CommandName::InjectionClear => "INJECTION_CLEAR",
            CommandName::InjectionQueue => "INJECTION_QUEUE",
            CommandName::InjectionStatus => "INJECTION_STATUS",
            CommandName::InjectionProcessResult => "INJECTION_PROCESS_RESULT",
            CommandName::InjectionExecute => "INJECTION_EXECUTE",
            CommandName::GetCommands => "GET_COMMANDS",
        }
    }

    /// Resolve a wire name, honouring the legacy `SPAWN` alias.
    pub fn from_wire(name: &str) -> Option<CommandName> {
        if name == "SPAWN" {
            return Some(CommandName::Completion);
        }
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s).ok_or_else(|| format!("unknown command: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckParams {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownParams {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadDaemonParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadStateParams {
    /// State serialised by the predecessor daemon.
    pub state_data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupType {
    Logs,
    Sessions,
    Sockets,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanupParams {
    pub cleanup_type: CleanupType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadModuleParams {
    pub module_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetCommandsParams {}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionParams {
    #[serde(default)]
    pub mode: CompletionMode,

    pub prompt: String,

    /// Resume this conversation; omitted starts a fresh session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default)]
    pub enable_tools: bool,

    /// Injection behaviour for the follow-up of this completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_config: Option<InjectionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_config: Option<CircuitBreakerConfig>,
}

/// How a completion result feeds back into future prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub mode: InjectionMode,

    #[serde(default)]
    pub position: InjectionPosition,

    /// Sessions to inject into; empty means the originating session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_sessions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<String>,
}

/// Recursion guards for injection chains. Token and time budgets are carried
/// and reported but not yet enforced; only the depth bound trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,

    #[serde(default = "CircuitBreakerConfig::default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "CircuitBreakerConfig::default_token_budget")]
    pub token_budget: u64,

    #[serde(default = "CircuitBreakerConfig::default_time_window")]
    pub time_window_secs: u64,
}

impl CircuitBreakerConfig {
    pub fn default_max_depth() -> u32 {
        5
    }

    pub fn default_token_budget() -> u64 {
        50_000
    }

    pub fn default_time_window() -> u64 {
        3_600
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            parent_request_id: None,
            max_depth: Self::default_max_depth(),
            token_budget: Self::default_token_budget(),
            time_window_secs: Self::default_time_window(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetProcessesParams {}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterAgentParams {
    pub agent_id: String,
    pub role: String,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpawnAgentParams {
    /// Initial task handed to the worker on startup.
    pub task: String,

    /// Composition (preferred) or profile to build the system prompt from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetAgentsParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteTaskParams {
    pub task: String,

    pub required_capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_agent_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageParams {
    pub from_agent: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,

    pub message_type: String,

    pub content: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    /// For `message_type == "SUBSCRIBE"` compatibility payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishParams {
    pub from_agent: String,
    pub event_type: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscribeParams {
    pub agent_id: String,
    pub event_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionAction {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConnectionParams {
    pub action: ConnectionAction,
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageBusStatsParams {}

// ---------------------------------------------------------------------------
// Keyed state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvScope {
    Private,
    #[default]
    Shared,
    Coordination,
}

impl KvScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvScope::Private => "private",
            KvScope::Shared => "shared",
            KvScope::Coordination => "coordination",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetAgentKvParams {
    pub key: String,

    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_agent_id: Option<String>,

    #[serde(default)]
    pub scope: KvScope,

    /// RFC-3339 expiry; omitted entries never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetAgentKvParams {
    /// Exact key; omit to list by filters instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_agent_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateIdentityParams {
    pub agent_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality_traits: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appearance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateIdentityParams {
    pub agent_id: String,

    /// Field/value pairs to merge; protected fields are rejected.
    pub updates: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetIdentityParams {
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListIdentitiesParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoveIdentityParams {
    pub agent_id: String,
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetCompositionsParams {
    #[serde(default)]
    pub include_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetCompositionParams {
    pub name: String,

    #[serde(default)]
    pub include_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidateCompositionParams {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComposePromptParams {
    pub composition: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListComponentsParams {
    /// Subdirectory of the component tree; omit for the whole tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

// ---------------------------------------------------------------------------
// Injection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    /// Queue a completion immediately.
    Direct,
    /// Store until the next outbound request on the target session.
    #[default]
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPosition {
    #[default]
    BeforePrompt,
    AfterPrompt,
    SystemReminder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPriority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionInjectParams {
    pub content: String,

    #[serde(default)]
    pub mode: InjectionMode,

    #[serde(default)]
    pub position: InjectionPosition,

    /// Required for `next` mode; optional target for `direct`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default)]
    pub priority: InjectionPriority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionBatchParams {
    pub injections: Vec<InjectionInjectParams>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionClearParams {
    pub session_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<InjectionMode>,
}

/// Registers injection metadata for an in-flight completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionQueueParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_config: Option<InjectionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_config: Option<CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionStatusParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionProcessResultParams {
    pub request_id: String,

    /// The completion result being folded back into the loop.
    pub result: Value,

    pub injection_metadata: InjectionMetadata,
}

/// Metadata a completion request carried for the injection router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_config: Option<InjectionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_config: Option<CircuitBreakerConfig>,

    /// Set on completions the router itself issued, to stop recursion.
    #[serde(default)]
    pub is_injection: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionExecuteParams {
    pub content: String,

    pub agent_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub priority: InjectionPriority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spawn_is_an_alias_for_completion() {
        assert_eq!(CommandName::from_wire("SPAWN"), Some(CommandName::Completion));
        assert_eq!(
            CommandName::from_wire("COMPLETION"),
            Some(CommandName::Completion)
        );
        assert_eq!(CommandName::from_wire("NOPE"), None);
    }

    #[test]
    fn every_command_round_trips_through_its_wire_name() {
        for &cmd in CommandName::ALL {
            assert_eq!(CommandName::from_wire(cmd.as_str()), Some(cmd));
            let as_json = serde_json::to_value(cmd).unwrap();
            assert_eq!(as_json.as_str().unwrap(), cmd.as_str());
        }
    }

    #[test]
    fn completion_params_reject_unknown_fields() {
        let bad = json!({"prompt": "hi", "promt": "typo"});
        assert!(serde_json::from_value::<CompletionParams>(bad).is_err());

        let good = json!({"prompt": "hi", "mode": "async", "agent_id": "a1"});
        let params: CompletionParams = serde_json::from_value(good).unwrap();
        assert_eq!(params.mode, CompletionMode::Async);
        assert!(!params.enable_tools);
    }

    #[test]
    fn kv_scope_defaults_to_shared() {
        let params: SetAgentKvParams =
            serde_json::from_value(json!({"key": "a.b.c", "value": 1})).unwrap();
        assert_eq!(params.scope, KvScope::Shared);
    }

    #[test]
    fn injection_defaults_match_the_router() {
        let params: InjectionInjectParams =
            serde_json::from_value(json!({"content": "note"})).unwrap();
        assert_eq!(params.mode, InjectionMode::Next);
        assert_eq!(params.position, InjectionPosition::BeforePrompt);
        assert_eq!(params.priority, InjectionPriority::Normal);

        let cb = CircuitBreakerConfig::default();
        assert_eq!(cb.max_depth, 5);
        assert_eq!(cb.token_budget, 50_000);
    }

    #[test]
    fn cleanup_type_parses_wire_form() {
        let params: CleanupParams =
            serde_json::from_value(json!({"cleanup_type": "logs"})).unwrap();
        assert_eq!(params.cleanup_type, CleanupType::Logs);
        assert!(serde_json::from_value::<CleanupParams>(json!({"cleanup_type": "nope"})).is_err());
    }
}
