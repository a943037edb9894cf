//! PID file and startup collision guard.
//!
//! Exactly one daemon owns a socket path. On startup we read the PID file;
//! if that process is alive, looks like a ksi daemon, and its socket
//! answers `HEALTH_CHECK`, the new process exits 0 without touching
//! anything. A stale PID or a dead socket is cleaned up and startup
//! proceeds.

use std::path::Path;

use anyhow::{Context, Result};

use ksi_protocol::DaemonClient;

use crate::config::DaemonConfig;

/// What the guard decided.
#[derive(Debug, PartialEq, Eq)]
pub enum CollisionOutcome {
    /// A healthy daemon already serves this socket; exit 0.
    AlreadyRunning { pid: u32 },
    /// No live daemon; stale files (if any) were removed.
    Proceed,
}

/// Run the collision check. Skipped entirely in `--hot-reload-from` mode,
/// where a predecessor legitimately owns the primary socket.
pub async fn check(config: &DaemonConfig) -> Result<CollisionOutcome> {
    let pid = match read_pid_file(&config.pid_file) {
        Some(pid) => pid,
        None => return Ok(CollisionOutcome::Proceed),
    };

    if process_looks_like_daemon(pid) {
        let healthy = DaemonClient::health_check(
            &config.socket_path,
            config.socket_timeout_duration(),
        )
        .await;
        if healthy {
            tracing::info!(pid, "healthy daemon already running");
            return Ok(CollisionOutcome::AlreadyRunning { pid });
        }
        tracing::warn!(pid, "daemon process exists but socket is unresponsive");
    } else {
        tracing::info!(pid, "stale PID file, no matching process");
    }

    remove_stale(config);
    Ok(CollisionOutcome::Proceed)
}

/// Record our PID. Called after the socket is bound.
pub fn write_pid_file(config: &DaemonConfig) -> Result<()> {
    if let Some(parent) = config.pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config.pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write {}", config.pid_file.display()))
}

/// Remove our PID file on graceful shutdown; only if it is still ours.
pub fn remove_pid_file(config: &DaemonConfig) {
    if read_pid_file(&config.pid_file) == Some(std::process::id()) {
        let _ = std::fs::remove_file(&config.pid_file);
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

/// Match the recorded PID against a live ksi daemon via /proc.
fn process_looks_like_daemon(pid: u32) -> bool {
    let cmdline_path = format!("/proc/{pid}/cmdline");
    match std::fs::read(&cmdline_path) {
        Ok(raw) => {
            let cmdline = String::from_utf8_lossy(&raw);
            cmdline.contains("ksi-daemon") || cmdline.contains("ksi_daemon")
        }
        Err(_) => false,
    }
}

fn remove_stale(config: &DaemonConfig) {
    let _ = std::fs::remove_file(&config.pid_file);
    let _ = std::fs::remove_file(&config.socket_path);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> DaemonConfig {
        DaemonConfig::default().rooted_at(dir.path())
    }

    #[tokio::test]
    async fn missing_pid_file_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        assert_eq!(check(&config).await.unwrap(), CollisionOutcome::Proceed);
    }

    #[tokio::test]
    async fn stale_pid_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        config.ensure_directories().unwrap();
        // A PID that cannot be a live daemon.
        std::fs::write(&config.pid_file, "4194304").unwrap();
        std::fs::write(&config.socket_path, "").unwrap();

        assert_eq!(check(&config).await.unwrap(), CollisionOutcome::Proceed);
        assert!(!config.pid_file.exists());
        assert!(!config.socket_path.exists());
    }

    #[tokio::test]
    async fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        write_pid_file(&config).unwrap();
        assert_eq!(
            read_pid_file(&config.pid_file),
            Some(std::process::id())
        );
        remove_pid_file(&config);
        assert!(!config.pid_file.exists());
    }

    #[tokio::test]
    async fn foreign_pid_file_is_left_alone_on_remove() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        config.ensure_directories().unwrap();
        std::fs::write(&config.pid_file, "1").unwrap();
        remove_pid_file(&config);
        assert!(config.pid_file.exists());
    }
}
