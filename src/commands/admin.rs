//! Admin-domain handlers: health, shutdown, hot reload, state transfer,
//! cleanup, extension modules and self-description.

use std::sync::Arc;

use serde_json::{json, Value};

use ksi_protocol::commands::{
    CleanupParams, CleanupType, GetCommandsParams, HealthCheckParams, LoadStateParams,
    ReloadDaemonParams, ReloadModuleParams, ShutdownParams,
};
use ksi_protocol::error::CommandError;
use ksi_protocol::ErrorCode;

use super::parse_params;
use crate::daemon::{ConnectionCtx, DaemonCore};
use crate::extension::ExtensionError;
use crate::reload::{self, HotReloadController, ReloadOutcome};

pub fn health_check(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let _: HealthCheckParams = parse_params(params)?;
    Ok(json!({
        "status": "healthy",
        "version": crate::VERSION,
        "uptime_seconds": core.uptime_seconds(),
        "agents": core.agents.len(),
        "processes": core.supervisor.len(),
        "sessions": core.sessions.len(),
    }))
}

pub fn shutdown(
    _core: &Arc<DaemonCore>,
    conn: &mut ConnectionCtx,
    params: Value,
) -> Result<Value, CommandError> {
    let _: ShutdownParams = parse_params(params)?;
    tracing::info!("shutdown requested over the socket");
    conn.shutdown_after_reply = true;
    Ok(json!({"status": "shutting_down"}))
}

pub async fn reload_daemon(
    core: &Arc<DaemonCore>,
    conn: &mut ConnectionCtx,
    params: Value,
) -> Result<Value, CommandError> {
    let _: ReloadDaemonParams = parse_params(params)?;
    let controller = HotReloadController::new(&core.config, &core.sessions, &core.agents);
    let outcome = controller.execute().await;
    if matches!(outcome, ReloadOutcome::HandedOver { .. }) {
        // The successor owns the primary socket; this daemon drains and
        // exits once the reply is flushed.
        conn.shutdown_after_reply = true;
    }
    Ok(outcome.to_result_value())
}

pub fn load_state(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: LoadStateParams = parse_params(params)?;
    reload::load_state(&core.sessions, &core.agents, &params.state_data)
        .map_err(|e| CommandError::new(ErrorCode::LoadStateFailed, e.to_string()))
}

pub async fn cleanup(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: CleanupParams = parse_params(params)?;
    let mut removed = json!({});

    let do_logs = matches!(params.cleanup_type, CleanupType::Logs | CleanupType::All);
    let do_sessions = matches!(params.cleanup_type, CleanupType::Sessions | CleanupType::All);
    let do_sockets = matches!(params.cleanup_type, CleanupType::Sockets | CleanupType::All);

    if do_logs {
        let mut count = remove_matching(&core.config.session_log_dir, |n| {
            n.ends_with(".jsonl") || n == "latest.jsonl"
        });
        count += remove_matching(&core.config.log_dir, |n| n.ends_with(".jsonl"));
        removed["logs"] = json!(count);
    }
    if do_sessions {
        let count = core.sessions.len();
        core.sessions.clear();
        removed["sessions"] = json!(count);
    }
    if do_sockets {
        let count = core
            .config
            .socket_path
            .parent()
            .map(|dir| remove_matching(dir, |n| n.ends_with(".sock.new")))
            .unwrap_or(0);
        removed["sockets"] = json!(count);
    }

    tracing::info!(cleanup_type = ?params.cleanup_type, removed = %removed, "cleanup complete");
    Ok(json!({"cleaned": removed}))
}

fn remove_matching(dir: &std::path::Path, matches: impl Fn(&str) -> bool) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if matches(name) && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

pub fn reload_module(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: ReloadModuleParams = parse_params(params)?;
    match core.extensions.reload(&params.module_name) {
        Ok((manifest, changed)) => Ok(json!({
            "module": manifest,
            "changed": changed,
        })),
        Err(e @ ExtensionError::NotFound(_)) => Err(CommandError::new(
            ErrorCode::ComponentNotFound,
            e.to_string(),
        )),
        Err(e) => Err(CommandError::new(
            ErrorCode::CommandProcessingFailed,
            e.to_string(),
        )),
    }
}

pub fn get_commands(params: Value) -> Result<Value, CommandError> {
    let _: GetCommandsParams = parse_params(params)?;
    let commands: Vec<Value> = super::DESCRIPTORS
        .iter()
        .map(|d| {
            json!({
                "name": d.name.as_str(),
                "domain": d.domain.as_str(),
                "summary": d.summary,
                "parameters": d.parameters,
            })
        })
        .collect();
    Ok(json!({
        "commands": commands,
        "aliases": {"SPAWN": "COMPLETION"},
    }))
}
