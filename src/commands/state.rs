//! State-domain handlers for the shared key-value store.

use std::sync::Arc;

use serde_json::{json, Value};

use ksi_protocol::commands::{GetAgentKvParams, SetAgentKvParams};
use ksi_protocol::error::CommandError;
use ksi_protocol::ErrorCode;

use super::parse_params;
use crate::daemon::DaemonCore;

pub async fn set_agent_kv(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: SetAgentKvParams = parse_params(params)?;
    if let Some(raw) = &params.expires_at {
        if chrono::DateTime::parse_from_rfc3339(raw).is_err() {
            return Err(CommandError::invalid_parameters(format!(
                "expires_at must be RFC-3339, got `{raw}`"
            )));
        }
    }
    let owner = params
        .owner_agent_id
        .unwrap_or_else(|| "daemon".to_string());
    let entry = core
        .kv
        .set(
            params.key,
            params.value,
            owner,
            params.scope,
            params.expires_at,
            params.metadata,
        )
        .await
        .map_err(|e| CommandError::new(ErrorCode::CommandProcessingFailed, e.to_string()))?;
    Ok(json!({"stored": entry}))
}

pub async fn get_agent_kv(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: GetAgentKvParams = parse_params(params)?;

    // Exact-key lookup, or a filtered listing when no key was given.
    if let Some(key) = params.key {
        let entry = core
            .kv
            .get(&key)
            .await
            .map_err(|e| CommandError::new(ErrorCode::CommandProcessingFailed, e.to_string()))?;
        return Ok(match entry {
            Some(entry) => json!({"found": true, "entry": entry}),
            None => json!({"found": false, "key": key}),
        });
    }

    let entries = core
        .kv
        .list(params.namespace, params.owner_agent_id)
        .await
        .map_err(|e| CommandError::new(ErrorCode::CommandProcessingFailed, e.to_string()))?;
    Ok(json!({"count": entries.len(), "entries": entries}))
}
