//! Per-connection dispatch loop.
//!
//! Each connection is one task: read a frame, validate, route, reply.
//! Replies and asynchronously pushed bus events share one writer behind a
//! mutex so frames never interleave. After `AGENT_CONNECTION connect` the
//! connection stays registered with the message bus as that agent's
//! delivery channel until disconnect, EOF or shutdown.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use ksi_protocol::envelope::{CommandEnvelope, Response, ResponseMetadata};
use ksi_protocol::error::CommandError;
use ksi_protocol::frame::{FrameError, FrameReader, FrameWriter};
use ksi_protocol::{CommandName, ErrorCode};

use super::DaemonCore;
use crate::commands;
use crate::messaging::EventSink;

/// Shared writer half: command replies and pushed event frames both go
/// through here.
pub struct ConnectionSink {
    writer: Mutex<FrameWriter<OwnedWriteHalf>>,
}

impl ConnectionSink {
    pub async fn write_frame<T: serde::Serialize>(&self, frame: &T) -> Result<(), FrameError> {
        self.writer.lock().await.write_frame(frame).await
    }
}

#[async_trait]
impl EventSink for ConnectionSink {
    async fn send_event(&self, event: &Value) -> Result<()> {
        self.write_frame(event).await?;
        Ok(())
    }
}

/// Mutable per-connection state handlers may touch.
pub struct ConnectionCtx {
    pub sink: Arc<ConnectionSink>,
    /// Set once the connection entered persistent agent mode.
    pub agent_id: Option<String>,
    /// `SHUTDOWN` replies first, then tears the daemon down.
    pub shutdown_after_reply: bool,
    /// `AGENT_CONNECTION connect` defers the offline-queue drain until the
    /// reply has been written, so the reply precedes pushed frames.
    pub drain_offline_for: Option<String>,
}

/// Drive one connection to completion.
pub async fn handle_connection(core: Arc<DaemonCore>, stream: UnixStream) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let sink = Arc::new(ConnectionSink {
        writer: Mutex::new(FrameWriter::new(write_half)),
    });
    let mut conn = ConnectionCtx {
        sink: sink.clone(),
        agent_id: None,
        shutdown_after_reply: false,
        drain_offline_for: None,
    };
    let mut shutdown_rx = core.shutdown_signal();

    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.recv() => break,
            frame = reader.read_frame::<Value>() => frame,
        };

        let raw = match frame {
            Ok(raw) => raw,
            Err(FrameError::Closed) => break,
            Err(e @ FrameError::InvalidJson(_)) | Err(e @ FrameError::TooLarge { .. }) => {
                // The stream stays aligned; report and keep reading.
                let reply = Response::error("", ErrorCode::InvalidJson, e.to_string());
                if sink.write_frame(&reply).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                break;
            }
        };

        let response = process_frame(&core, &mut conn, raw).await;
        if sink.write_frame(&response).await.is_err() {
            break;
        }
        if let Some(agent_id) = conn.drain_offline_for.take() {
            core.bus.drain_offline(&agent_id).await;
        }
        if conn.shutdown_after_reply {
            core.shutdown();
            break;
        }
    }

    if let Some(agent_id) = conn.agent_id.take() {
        core.bus.disconnect(&agent_id).await;
    }
}

/// Validate one raw frame and run its command.
async fn process_frame(
    core: &Arc<DaemonCore>,
    conn: &mut ConnectionCtx,
    raw: Value,
) -> Response {
    let envelope: CommandEnvelope = match serde_json::from_value(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Response::error(
                "",
                ErrorCode::InvalidCommand,
                format!("not a valid command envelope: {e}"),
            );
        }
    };

    let wire_name = envelope.command.clone();
    let request_id = envelope.request_id();
    let Some(name) = CommandName::from_wire(&wire_name) else {
        return Response::error(
            wire_name,
            ErrorCode::UnknownCommand,
            "command is not registered; see GET_COMMANDS",
        );
    };

    let span = tracing::info_span!(
        "command",
        command = %wire_name,
        domain = %commands::domain_of(name),
        request_id = %request_id,
        client_id = envelope
            .metadata
            .as_ref()
            .and_then(|m| m.client_id.as_deref())
            .unwrap_or("-"),
    );

    use tracing::Instrument;
    let result = commands::dispatch(core, conn, name, envelope.parameters)
        .instrument(span.clone())
        .await;
    let _entered = span.enter();
    let mut response = match result {
        Ok(result) => Response::success(wire_name.as_str(), result),
        Err(CommandError { code, message }) => {
            tracing::warn!(code = code.as_str(), message = %message, "command failed");
            Response::error(wire_name.as_str(), code, message)
        }
    };
    attach_request_id(&mut response, &request_id);
    response
}

fn attach_request_id(response: &mut Response, request_id: &str) {
    let metadata = match response {
        Response::Success { metadata, .. } | Response::Error { metadata, .. } => metadata,
    };
    *metadata = ResponseMetadata::with_request_id(request_id);
}
