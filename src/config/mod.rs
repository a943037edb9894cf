//! Daemon configuration.
//!
//! Three layers, weakest first: built-in defaults, an optional config file,
//! then `KSI_*` environment variables. `KSI_SOCKET_PATH` overrides
//! `socket_path`, `KSI_DB_PATH` overrides `db_path`, and so on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Primary Unix socket path.
    pub socket_path: PathBuf,

    /// PID file used by the startup collision guard.
    pub pid_file: PathBuf,

    /// SQLite database backing the shared key-value store.
    pub db_path: PathBuf,

    /// JSON document holding all agent identities.
    pub identity_storage_path: PathBuf,

    /// Directory for the structured daemon log (JSON lines).
    pub log_dir: PathBuf,

    /// Directory for per-session conversation logs.
    pub session_log_dir: PathBuf,

    /// Scratch directory (shadow sockets, partial writes).
    pub tmp_dir: PathBuf,

    /// Default tracing filter, e.g. `info` or `ksi=debug`.
    pub log_level: String,

    /// Per-operation socket timeout in seconds for health probes.
    pub socket_timeout: u64,

    /// Root of the prompt composition tree.
    pub prompts_dir: PathBuf,

    /// Directory of declarative extension-module manifests.
    pub extension_dir: PathBuf,

    pub llm: LlmConfig,

    /// Program launched for `SPAWN_AGENT` workers.
    pub worker_program: String,

    /// Bound on the message-bus history ring.
    pub message_history_max: usize,

    /// Bound on each agent's offline queue.
    pub offline_queue_max: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("var/run/ksi_daemon.sock"),
            pid_file: PathBuf::from("var/run/ksi_daemon.pid"),
            db_path: PathBuf::from("var/db/agent_shared_state.db"),
            identity_storage_path: PathBuf::from("var/db/identities.json"),
            log_dir: PathBuf::from("var/logs/daemon"),
            session_log_dir: PathBuf::from("var/logs/sessions"),
            tmp_dir: PathBuf::from("var/tmp"),
            log_level: "info".to_string(),
            socket_timeout: 2,
            prompts_dir: PathBuf::from("prompts"),
            extension_dir: PathBuf::from("extension_modules"),
            llm: LlmConfig::default(),
            worker_program: "ksi-agent-worker".to_string(),
            message_history_max: 1000,
            offline_queue_max: 100,
        }
    }
}

/// How the daemon invokes the LLM child CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Executable name; must be on PATH.
    pub program: String,

    /// Model passed with `--model` when the caller does not choose one.
    pub default_model: String,

    /// Tools granted when a completion asks for `enable_tools`.
    pub allowed_tools: Vec<String>,

    /// Wall-clock bound on a single completion, in seconds.
    pub completion_timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            default_model: "sonnet".to_string(),
            allowed_tools: [
                "Task", "Bash", "Glob", "Grep", "LS", "Read", "Edit", "MultiEdit", "Write",
                "WebFetch", "WebSearch",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            completion_timeout: 300,
        }
    }
}

impl DaemonConfig {
    /// Load configuration: defaults, then `config_file` if given, then
    /// `KSI_*` environment overrides.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("KSI")
                    .try_parsing(true)
                    .separator("__"),
            )
            .build()
            .context("failed to assemble configuration")?;

        settings
            .try_deserialize::<DaemonConfig>()
            .context("invalid configuration values")
    }

    pub fn socket_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }

    /// The shadow socket used while a successor boots during hot reload.
    pub fn shadow_socket_path(&self) -> PathBuf {
        let mut name = self
            .socket_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "ksi_daemon.sock".into());
        name.push(".new");
        self.socket_path.with_file_name(name)
    }

    /// Path of the message-bus event log, kept under the configured log
    /// tree rather than any hard-coded directory.
    pub fn bus_log_path(&self) -> PathBuf {
        self.log_dir.join("message_bus.jsonl")
    }

    /// Path of the task-routing decision log.
    pub fn routing_log_path(&self) -> PathBuf {
        self.log_dir.join("task_routing.jsonl")
    }

    /// Where the most recent session id is persisted between runs.
    pub fn last_session_path(&self) -> PathBuf {
        self.session_log_dir.join("last_session_id")
    }

    /// Create every directory the daemon writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        let mut dirs: Vec<&Path> = vec![&self.log_dir, &self.session_log_dir, &self.tmp_dir];
        if let Some(parent) = self.socket_path.parent() {
            dirs.push(parent);
        }
        if let Some(parent) = self.db_path.parent() {
            dirs.push(parent);
        }
        if let Some(parent) = self.identity_storage_path.parent() {
            dirs.push(parent);
        }
        for dir in dirs {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Re-root every relative path under `base`. Used by tests and by
    /// `--hot-reload-from` successors inheriting the predecessor's layout.
    pub fn rooted_at(mut self, base: &Path) -> Self {
        let reroot = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        reroot(&mut self.socket_path);
        reroot(&mut self.pid_file);
        reroot(&mut self.db_path);
        reroot(&mut self.identity_storage_path);
        reroot(&mut self.log_dir);
        reroot(&mut self.session_log_dir);
        reroot(&mut self.tmp_dir);
        reroot(&mut self.prompts_dir);
        reroot(&mut self.extension_dir);
        self
    }
}
