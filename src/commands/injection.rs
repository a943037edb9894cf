//! Injection-domain handlers, thin wrappers over the injection router.

use std::sync::Arc;

use serde_json::{json, Value};

use ksi_protocol::commands::{
    InjectionBatchParams, InjectionClearParams, InjectionExecuteParams, InjectionInjectParams,
    InjectionListParams, InjectionProcessResultParams, InjectionQueueParams,
    InjectionStatusParams,
};
use ksi_protocol::error::CommandError;

use super::parse_params;
use crate::completion::CompletionRequest;
use crate::daemon::DaemonCore;

pub async fn inject(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: InjectionInjectParams = parse_params(params)?;
    Ok(core.injection.inject(params).await)
}

pub async fn inject_batch(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: InjectionBatchParams = parse_params(params)?;
    Ok(core.injection.inject_batch(params.injections).await)
}

pub fn list(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: InjectionListParams = parse_params(params)?;
    Ok(core.injection.list_pending(params.session_id.as_deref()))
}

pub fn clear(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: InjectionClearParams = parse_params(params)?;
    Ok(core.injection.clear(&params.session_id, params.mode))
}

pub fn queue(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: InjectionQueueParams = parse_params(params)?;
    let request_id = core.injection.queue_metadata(
        params.id,
        params.injection_config,
        params.circuit_breaker_config,
    );
    Ok(json!({"request_id": request_id}))
}

pub fn status(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: InjectionStatusParams = parse_params(params)?;
    let mut status = core.injection.status();
    status["circuit_breaker"] = core
        .injection
        .breaker_status(params.parent_request_id.as_deref());
    Ok(status)
}

pub async fn process_result(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: InjectionProcessResultParams = parse_params(params)?;
    Ok(core
        .injection
        .process_result(&params.request_id, &params.result, &params.injection_metadata)
        .await)
}

/// Turn stored injection content into a fresh completion. Fire and forget:
/// the outcome surfaces through the usual completion events.
pub async fn execute(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: InjectionExecuteParams = parse_params(params)?;
    let request_id = params
        .request_id
        .map(|id| format!("inj_{id}_{}", params.agent_id))
        .unwrap_or_else(|| format!("inj_{}_{}", uuid::Uuid::new_v4(), params.agent_id));

    let request = CompletionRequest {
        request_id: request_id.clone(),
        process_id: None,
        prompt: params.content,
        session_id: None,
        model: params.model,
        agent_id: Some(params.agent_id.clone()),
        enable_tools: false,
    };

    let core = core.clone();
    let spawned_request_id = request_id.clone();
    tokio::spawn(async move {
        match core.completion.run(request).await {
            Ok(outcome) => tracing::info!(
                request_id = %spawned_request_id,
                process_id = %outcome.process_id,
                "executed injection completion"
            ),
            Err(e) => tracing::error!(
                request_id = %spawned_request_id,
                error = %e,
                "injection execution failed"
            ),
        }
    });

    Ok(json!({
        "status": "injection_executed",
        "agent_id": params.agent_id,
        "request_id": request_id,
    }))
}
