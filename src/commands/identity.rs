//! Identity CRUD handlers.

use std::sync::Arc;

use serde_json::{json, Value};

use ksi_protocol::commands::{
    CreateIdentityParams, GetIdentityParams, ListIdentitiesParams, RemoveIdentityParams,
    UpdateIdentityParams,
};
use ksi_protocol::error::CommandError;
use ksi_protocol::ErrorCode;

use super::parse_params;
use crate::daemon::DaemonCore;
use crate::identity::IdentityError;

pub async fn create_identity(
    core: &Arc<DaemonCore>,
    params: Value,
) -> Result<Value, CommandError> {
    let params: CreateIdentityParams = parse_params(params)?;
    let identity = core
        .identities
        .create(
            &params.agent_id,
            params.display_name,
            params.role,
            params.personality_traits,
            params.appearance,
        )
        .await
        .map_err(|e| CommandError::new(ErrorCode::CommandProcessingFailed, e.to_string()))?;
    Ok(json!({"identity": identity}))
}

pub async fn update_identity(
    core: &Arc<DaemonCore>,
    params: Value,
) -> Result<Value, CommandError> {
    let params: UpdateIdentityParams = parse_params(params)?;
    match core.identities.update(&params.agent_id, &params.updates).await {
        Ok(identity) => Ok(json!({"identity": identity})),
        Err(e @ IdentityError::NotFound(_)) => Err(CommandError::new(
            ErrorCode::IdentityNotFound,
            e.to_string(),
        )),
        Err(e) => Err(CommandError::new(ErrorCode::UpdateFailed, e.to_string())),
    }
}

pub async fn get_identity(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: GetIdentityParams = parse_params(params)?;
    match core.identities.get(&params.agent_id).await {
        Some(identity) => Ok(json!({"identity": identity})),
        None => Err(CommandError::new(
            ErrorCode::IdentityNotFound,
            format!("no identity for agent {}", params.agent_id),
        )),
    }
}

pub async fn list_identities(
    core: &Arc<DaemonCore>,
    params: Value,
) -> Result<Value, CommandError> {
    let _: ListIdentitiesParams = parse_params(params)?;
    let identities = core.identities.list().await;
    Ok(json!({"count": identities.len(), "identities": identities}))
}

pub async fn remove_identity(
    core: &Arc<DaemonCore>,
    params: Value,
) -> Result<Value, CommandError> {
    let params: RemoveIdentityParams = parse_params(params)?;
    let removed = core
        .identities
        .remove(&params.agent_id)
        .await
        .map_err(|e| CommandError::new(ErrorCode::CommandProcessingFailed, e.to_string()))?;
    match removed {
        Some(identity) => Ok(json!({"removed": identity.agent_id})),
        None => Err(CommandError::new(
            ErrorCode::IdentityNotFound,
            format!("no identity for agent {}", params.agent_id),
        )),
    }
}
