//! Completion-domain handlers: LLM invocation (sync and async) and the
//! supervised-process listing.

use std::sync::Arc;

use serde_json::{json, Value};

use ksi_protocol::commands::{
    CompletionMode, CompletionParams, GetProcessesParams, InjectionMetadata,
};
use ksi_protocol::error::CommandError;
use ksi_protocol::ErrorCode;

use super::parse_params;
use crate::completion::CompletionRequest;
use crate::daemon::DaemonCore;
use crate::messaging::build_event;

pub async fn completion(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: CompletionParams = parse_params(params)?;
    if params.prompt.trim().is_empty() {
        return Err(CommandError::invalid_parameters("prompt must not be empty"));
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let injection_metadata = params.injection_config.as_ref().map(|config| {
        let metadata = InjectionMetadata {
            injection_config: Some(config.clone()),
            circuit_breaker_config: params.circuit_breaker_config.clone(),
            is_injection: false,
        };
        core.injection.queue_metadata(
            Some(request_id.clone()),
            metadata.injection_config.clone(),
            metadata.circuit_breaker_config.clone(),
        );
        metadata
    });

    // Stored next-mode injections for this session ride along with this
    // prompt.
    let prompt = match &params.session_id {
        Some(session_id) => core.injection.apply_pending(session_id, &params.prompt),
        None => params.prompt.clone(),
    };

    let request = CompletionRequest {
        request_id: request_id.clone(),
        process_id: Some(format!("llm_{}", uuid::Uuid::new_v4())),
        prompt,
        session_id: params.session_id.clone(),
        model: params.model.clone(),
        agent_id: params.agent_id.clone(),
        enable_tools: params.enable_tools,
    };

    match params.mode {
        CompletionMode::Sync => {
            let outcome = core
                .completion
                .run(request)
                .await
                .map_err(|e| CommandError::new(ErrorCode::SpawnFailed, e.to_string()))?;
            if let Some(metadata) = injection_metadata {
                let routed = core
                    .injection
                    .process_result(&request_id, &outcome.to_result_value(), &metadata)
                    .await;
                tracing::debug!(request_id = %request_id, routed = %routed, "injection routing");
            }
            Ok(outcome.to_result_value())
        }
        CompletionMode::Async => {
            let process_id = request
                .process_id
                .clone()
                .unwrap_or_else(|| format!("llm_{}", uuid::Uuid::new_v4()));
            let core = core.clone();
            let agent_id = params.agent_id.clone();
            let async_request_id = request_id.clone();
            tokio::spawn(async move {
                let result = core.completion.run(request).await;
                match result {
                    Ok(outcome) => {
                        if let Some(agent_id) = &agent_id {
                            let event = build_event(
                                "daemon",
                                "PROCESS_COMPLETE",
                                &json!({
                                    "to": agent_id,
                                    "process_id": outcome.process_id,
                                    "session_id": outcome.session_id,
                                    "result": outcome.response,
                                }),
                            );
                            core.bus.deliver_to_agent(agent_id, event).await;
                        }
                        if let Some(metadata) = injection_metadata {
                            let routed = core
                                .injection
                                .process_result(
                                    &async_request_id,
                                    &outcome.to_result_value(),
                                    &metadata,
                                )
                                .await;
                            tracing::debug!(
                                request_id = %async_request_id,
                                routed = %routed,
                                "injection routing"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::error!(request_id = %async_request_id, error = %e, "async completion failed");
                        if let Some(agent_id) = &agent_id {
                            let event = build_event(
                                "daemon",
                                "COMPLETION_FAILED",
                                &json!({
                                    "to": agent_id,
                                    "request_id": async_request_id,
                                    "error": e.to_string(),
                                }),
                            );
                            core.bus.deliver_to_agent(agent_id, event).await;
                        }
                    }
                }
            });
            Ok(json!({
                "process_id": process_id,
                "request_id": request_id,
                "status": "started",
            }))
        }
    }
}

pub fn get_processes(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let _: GetProcessesParams = parse_params(params)?;
    let processes = core.supervisor.list();
    Ok(json!({"count": processes.len(), "processes": processes}))
}
