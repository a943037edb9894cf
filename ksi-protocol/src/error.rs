//! Wire error taxonomy.
//!
//! Every error reply carries one of these stable codes. The daemon maps
//! internal failures onto them at the dispatch boundary; stack traces stay
//! in the structured log, never on the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[error("request frame was not valid JSON")]
    InvalidJson,
    #[error("request was not a valid command envelope")]
    InvalidCommand,
    #[error("command is not registered")]
    UnknownCommand,
    #[error("parameters failed validation")]
    InvalidParameters,
    #[error("unsupported completion mode")]
    InvalidMode,

    #[error("process manager unavailable")]
    NoProcessManager,
    #[error("agent manager unavailable")]
    NoAgentManager,
    #[error("state manager unavailable")]
    NoStateManager,
    #[error("message bus unavailable")]
    NoMessageBus,
    #[error("orchestrator unavailable")]
    NoOrchestrator,
    #[error("hot reload manager unavailable")]
    NoHotReloadManager,
    #[error("identity manager unavailable")]
    NoIdentityManager,

    #[error("agent not found")]
    AgentNotFound,
    #[error("agent is not connected")]
    AgentNotConnected,
    #[error("sender not found")]
    SenderNotFound,
    #[error("recipient not found")]
    RecipientNotFound,

    #[error("composition not found")]
    CompositionNotFound,
    #[error("composition is invalid")]
    CompositionInvalid,
    #[error("component not found")]
    ComponentNotFound,
    #[error("context validation failed")]
    ContextValidationError,
    #[error("prompt composer unavailable")]
    ComposerUnavailable,
    #[error("composition failed")]
    CompositionFailed,

    #[error("identity not found")]
    IdentityNotFound,
    #[error("identity update failed")]
    UpdateFailed,

    #[error("state load failed")]
    LoadStateFailed,
    #[error("spawn failed")]
    SpawnFailed,
    #[error("delivery failed")]
    DeliveryFailed,
    #[error("subscription failed")]
    SubscriptionFailed,
    #[error("command processing failed")]
    CommandProcessingFailed,
}

impl ErrorCode {
    /// The wire form, e.g. `INVALID_PARAMETERS`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::InvalidCommand => "INVALID_COMMAND",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::InvalidParameters => "INVALID_PARAMETERS",
            ErrorCode::InvalidMode => "INVALID_MODE",
            ErrorCode::NoProcessManager => "NO_PROCESS_MANAGER",
            ErrorCode::NoAgentManager => "NO_AGENT_MANAGER",
            ErrorCode::NoStateManager => "NO_STATE_MANAGER",
            ErrorCode::NoMessageBus => "NO_MESSAGE_BUS",
            ErrorCode::NoOrchestrator => "NO_ORCHESTRATOR",
            ErrorCode::NoHotReloadManager => "NO_HOT_RELOAD_MANAGER",
            ErrorCode::NoIdentityManager => "NO_IDENTITY_MANAGER",
            ErrorCode::AgentNotFound => "AGENT_NOT_FOUND",
            ErrorCode::AgentNotConnected => "AGENT_NOT_CONNECTED",
            ErrorCode::SenderNotFound => "SENDER_NOT_FOUND",
            ErrorCode::RecipientNotFound => "RECIPIENT_NOT_FOUND",
            ErrorCode::CompositionNotFound => "COMPOSITION_NOT_FOUND",
            ErrorCode::CompositionInvalid => "COMPOSITION_INVALID",
            ErrorCode::ComponentNotFound => "COMPONENT_NOT_FOUND",
            ErrorCode::ContextValidationError => "CONTEXT_VALIDATION_ERROR",
            ErrorCode::ComposerUnavailable => "COMPOSER_UNAVAILABLE",
            ErrorCode::CompositionFailed => "COMPOSITION_FAILED",
            ErrorCode::IdentityNotFound => "IDENTITY_NOT_FOUND",
            ErrorCode::UpdateFailed => "UPDATE_FAILED",
            ErrorCode::LoadStateFailed => "LOAD_STATE_FAILED",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::DeliveryFailed => "DELIVERY_FAILED",
            ErrorCode::SubscriptionFailed => "SUBSCRIPTION_FAILED",
            ErrorCode::CommandProcessingFailed => "COMMAND_PROCESSING_FAILED",
        }
    }
}

/// A failed command: stable code plus a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParameters, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_in_wire_form() {
        for (code, wire) in [
            (ErrorCode::InvalidJson, "\"INVALID_JSON\""),
            (ErrorCode::AgentNotConnected, "\"AGENT_NOT_CONNECTED\""),
            (ErrorCode::CompositionNotFound, "\"COMPOSITION_NOT_FOUND\""),
        ] {
            assert_eq!(serde_json::to_string(&code).unwrap(), wire);
        }
    }

    #[test]
    fn as_str_matches_serde_form() {
        let codes = [
            ErrorCode::InvalidJson,
            ErrorCode::InvalidCommand,
            ErrorCode::UnknownCommand,
            ErrorCode::InvalidParameters,
            ErrorCode::InvalidMode,
            ErrorCode::NoProcessManager,
            ErrorCode::AgentNotFound,
            ErrorCode::SenderNotFound,
            ErrorCode::RecipientNotFound,
            ErrorCode::ComponentNotFound,
            ErrorCode::ContextValidationError,
            ErrorCode::LoadStateFailed,
            ErrorCode::CommandProcessingFailed,
        ];
        for code in codes {
            let serde_form = serde_json::to_value(code).unwrap();
            assert_eq!(serde_form.as_str().unwrap(), code.as_str());
        }
    }
}
