//! Messaging-domain handlers: the persistent agent channel, subscriptions,
//! direct messages, publish and bus diagnostics.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use ksi_protocol::commands::{
    AgentConnectionParams, ConnectionAction, MessageBusStatsParams, PublishParams,
    SendMessageParams, SubscribeParams,
};
use ksi_protocol::error::CommandError;
use ksi_protocol::ErrorCode;

use super::parse_params;
use crate::daemon::{ConnectionCtx, DaemonCore};
use crate::identity::Activity;

pub async fn agent_connection(
    core: &Arc<DaemonCore>,
    conn: &mut ConnectionCtx,
    params: Value,
) -> Result<Value, CommandError> {
    let params: AgentConnectionParams = parse_params(params)?;
    match params.action {
        ConnectionAction::Connect => {
            // From here on this connection doubles as the agent's delivery
            // channel; the dispatcher keeps reading further commands and
            // drains any offline queue once the reply is on the wire.
            core.bus.connect(&params.agent_id, conn.sink.clone()).await;
            conn.agent_id = Some(params.agent_id.clone());
            conn.drain_offline_for = Some(params.agent_id.clone());
            Ok(json!({"status": "connected", "agent_id": params.agent_id}))
        }
        ConnectionAction::Disconnect => {
            core.bus.disconnect(&params.agent_id).await;
            if conn.agent_id.as_deref() == Some(params.agent_id.as_str()) {
                conn.agent_id = None;
            }
            Ok(json!({"status": "disconnected", "agent_id": params.agent_id}))
        }
    }
}

pub async fn subscribe(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: SubscribeParams = parse_params(params)?;
    if core.bus.subscribe(&params.agent_id, &params.event_types).await {
        Ok(json!({
            "agent_id": params.agent_id,
            "subscribed": params.event_types,
        }))
    } else {
        Err(CommandError::new(
            ErrorCode::AgentNotConnected,
            format!(
                "agent {} has no active connection; send AGENT_CONNECTION connect first",
                params.agent_id
            ),
        ))
    }
}

pub async fn publish(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: PublishParams = parse_params(params)?;
    let outcome = core
        .bus
        .publish(&params.from_agent, &params.event_type, &params.payload)
        .await;
    Ok(json!({"publish": outcome}))
}

pub async fn send_message(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: SendMessageParams = parse_params(params)?;

    if !core.agents.contains(&params.from_agent) {
        return Err(CommandError::new(
            ErrorCode::SenderNotFound,
            format!("agent {} is not registered", params.from_agent),
        ));
    }
    if let Some(to_agent) = &params.to_agent {
        let known =
            core.agents.contains(to_agent) || core.bus.is_connected(to_agent).await;
        if !known {
            return Err(CommandError::new(
                ErrorCode::RecipientNotFound,
                format!("agent {to_agent} is neither registered nor connected"),
            ));
        }
    }

    let mut payload = Map::new();
    if let Some(to_agent) = &params.to_agent {
        payload.insert("to".to_string(), json!(to_agent));
    }
    payload.insert("content".to_string(), params.content);
    if let Some(metadata) = params.metadata {
        payload.insert("metadata".to_string(), metadata);
    }
    if let Some(event_types) = params.event_types {
        payload.insert("event_types".to_string(), json!(event_types));
    }

    let outcome = core
        .bus
        .publish(&params.from_agent, &params.message_type, &Value::Object(payload))
        .await;

    let _ = core
        .identities
        .record_activity(&params.from_agent, Activity::MessageSent)
        .await;
    core.agents.touch(&params.from_agent);

    Ok(json!({"delivery": outcome}))
}

pub async fn message_bus_stats(
    core: &Arc<DaemonCore>,
    params: Value,
) -> Result<Value, CommandError> {
    let _: MessageBusStatsParams = parse_params(params)?;
    Ok(core.bus.stats().await)
}
