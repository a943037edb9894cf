//! ksi — a coordination daemon for fleets of LLM-driven agents.
//!
//! The daemon owns all state: agent registry, identities, sessions, the
//! shared key-value store, the message bus, the completion pipeline and the
//! injection router. Agents are external child processes that talk to it
//! over a single Unix socket carrying newline-delimited JSON commands
//! (see the `ksi-protocol` crate).

pub mod agents;
pub mod commands;
pub mod completion;
pub mod composer;
pub mod config;
pub mod daemon;
pub mod extension;
pub mod identity;
pub mod injection;
pub mod logging;
pub mod messaging;
pub mod process;
pub mod reload;
pub mod state;

pub use config::DaemonConfig;
pub use daemon::KsiDaemon;

/// Daemon version reported by `HEALTH_CHECK`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
