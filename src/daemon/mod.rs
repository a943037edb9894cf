//! Daemon core: dependency wiring, the socket server, signal handling and
//! graceful shutdown.
//!
//! Every manager is constructed once in `DaemonCore::wire` and shared via
//! `Arc`; handlers receive the core explicitly. The only process-global
//! state is the static command table.

pub mod dispatcher;
pub mod pid_guard;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::broadcast;

use crate::agents::{AgentManager, AgentStatus};
use crate::completion::{CompletionPipeline, CompletionRequest};
use crate::composer::PromptComposer;
use crate::config::DaemonConfig;
use crate::extension::ExtensionRegistry;
use crate::identity::IdentityManager;
use crate::injection::InjectionRouter;
use crate::messaging::MessageBus;
use crate::process::ProcessSupervisor;
use crate::state::{SessionTracker, SharedStateStore};

pub use dispatcher::{ConnectionCtx, ConnectionSink};

/// How often the KV store sweeps expired rows.
const KV_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// All managers, wired once at startup.
pub struct DaemonCore {
    pub config: DaemonConfig,
    pub started_at: Instant,
    pub sessions: Arc<SessionTracker>,
    pub kv: SharedStateStore,
    pub identities: Arc<IdentityManager>,
    pub agents: Arc<AgentManager>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub bus: Arc<MessageBus>,
    pub injection: Arc<InjectionRouter>,
    pub composer: Arc<PromptComposer>,
    pub completion: Arc<CompletionPipeline>,
    pub extensions: Arc<ExtensionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DaemonCore {
    /// Construct every manager against `config`. Directories are created;
    /// SQLite and the identity store are opened (both fatal on failure).
    pub fn wire(config: DaemonConfig) -> Result<Arc<Self>> {
        config.ensure_directories()?;

        let sessions = Arc::new(SessionTracker::new(Some(config.last_session_path())));
        let kv = SharedStateStore::open(&config.db_path)?;
        let identities = Arc::new(IdentityManager::load(config.identity_storage_path.clone())?);
        let agents = Arc::new(AgentManager::new(Some(config.routing_log_path())));
        let supervisor = Arc::new(ProcessSupervisor::new());
        let bus = Arc::new(MessageBus::new(
            Some(config.bus_log_path()),
            config.message_history_max,
            config.offline_queue_max,
        ));
        let composer = Arc::new(PromptComposer::new(config.prompts_dir.clone()));
        let injection = Arc::new(InjectionRouter::new(bus.clone()).with_composer(composer.clone()));
        let extensions = Arc::new(ExtensionRegistry::load(config.extension_dir.clone())?);
        let completion = Arc::new(CompletionPipeline::new(
            config.llm.clone(),
            config.session_log_dir.clone(),
            supervisor.clone(),
            sessions.clone(),
            agents.clone(),
            identities.clone(),
            bus.clone(),
            None,
        ));

        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Arc::new(Self {
            config,
            started_at: Instant::now(),
            sessions,
            kv,
            identities,
            agents,
            supervisor,
            bus,
            injection,
            composer,
            completion,
            extensions,
            shutdown_tx,
        }))
    }

    /// Signal every task to exit at its next suspension point.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// The running daemon: socket server plus background tasks.
pub struct KsiDaemon {
    core: Arc<DaemonCore>,
    listener: UnixListener,
}

impl KsiDaemon {
    /// Bind the socket and prepare to serve. Any stale socket file was
    /// either removed by the collision guard or belongs to a crashed run;
    /// a live daemon would have made the guard exit first.
    pub fn bind(core: Arc<DaemonCore>) -> Result<Self> {
        let socket_path = &core.config.socket_path;
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("failed to remove stale {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        tracing::info!(socket = %socket_path.display(), "daemon listening");
        Ok(Self { core, listener })
    }

    pub fn core(&self) -> Arc<DaemonCore> {
        self.core.clone()
    }

    /// Serve until shutdown: accept loop, injection queue processor, KV
    /// sweeper and signal handlers all run as peer tasks.
    pub async fn run(self) -> Result<()> {
        let core = self.core;

        pid_guard::write_pid_file(&core.config)?;
        spawn_signal_handlers(core.clone());
        spawn_injection_processor(core.clone());
        spawn_kv_sweeper(core.clone());

        let mut shutdown_rx = core.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let core = core.clone();
                            tokio::spawn(async move {
                                dispatcher::handle_connection(core, stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        tracing::info!("shutting down");
        core.injection.shutdown().await;
        core.supervisor.shutdown_all().await;

        // A hot-reload successor may own the socket path by now; only
        // remove it when it is still ours (the rename replaced the inode).
        let _ = std::fs::remove_file(&core.config.socket_path);
        pid_guard::remove_pid_file(&core.config);
        tracing::info!("shutdown complete");
        Ok(())
    }
}

fn spawn_signal_handlers(core: Arc<DaemonCore>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = sigint.recv() => tracing::info!("received SIGINT"),
        }
        core.shutdown();
    });
}

/// One task drains the injection queue; executions run in FIFO order and
/// failures surface as completion events, never as panics.
fn spawn_injection_processor(core: Arc<DaemonCore>) {
    let receiver = core.injection.queue_receiver();
    tokio::spawn(async move {
        while let Ok(item) = receiver.recv().await {
            let Some(execution) = item else {
                tracing::info!("injection queue processor stopping");
                break;
            };
            let session_id = execution
                .session_id
                .filter(|s| s != "originating");
            let request = CompletionRequest {
                request_id: execution.request_id.clone(),
                process_id: None,
                prompt: execution.content,
                session_id,
                model: None,
                agent_id: execution.agent_id,
                enable_tools: false,
            };
            match core.completion.run(request).await {
                Ok(outcome) => tracing::info!(
                    request_id = %execution.request_id,
                    process_id = %outcome.process_id,
                    "injection completion finished"
                ),
                Err(e) => tracing::error!(
                    request_id = %execution.request_id,
                    error = %e,
                    "injection completion failed"
                ),
            }
        }
    });
}

fn spawn_kv_sweeper(core: Arc<DaemonCore>) {
    tokio::spawn(async move {
        let mut shutdown_rx = core.shutdown_signal();
        let mut ticker = tokio::time::interval(KV_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    match core.kv.sweep_expired().await {
                        Ok(0) => {}
                        Ok(swept) => tracing::info!(swept, "swept expired KV entries"),
                        Err(e) => tracing::error!(error = %e, "KV sweep failed"),
                    }
                }
            }
        }
    });
}

/// Publish `AGENT_TERMINATED` and mark the agent inactive when its worker
/// exits. Installed as the supervisor's exit callback by `SPAWN_AGENT`.
pub fn worker_exit_handler(
    bus: Arc<MessageBus>,
    agents: Arc<AgentManager>,
) -> impl FnOnce(String, Option<i32>) + Send + 'static {
    move |agent_id: String, exit_code: Option<i32>| {
        agents.set_status(&agent_id, AgentStatus::Inactive);
        tokio::spawn(async move {
            bus.publish(
                "daemon",
                "AGENT_TERMINATED",
                &serde_json::json!({
                    "agent_id": agent_id,
                    "exit_code": exit_code,
                }),
            )
            .await;
        });
    }
}
