//! Structured logging.
//!
//! Two layers: a compact human-readable layer on stderr and a JSON-lines
//! layer appended to `<log_dir>/daemon.log`. Handlers bind request context
//! (request id, functional domain, agent/session ids) as span fields so
//! every line in the file can be correlated with its originating command.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The functional domain a command belongs to, used to tag log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Admin,
    Agents,
    Messaging,
    State,
    Completion,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Admin => "admin",
            Domain::Agents => "agents",
            Domain::Messaging => "messaging",
            Domain::State => "state",
            Domain::Completion => "completion",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install the global subscriber. Call once, before the daemon starts.
///
/// `RUST_LOG` wins over the configured level when set, matching the usual
/// tracing-subscriber behaviour.
pub fn init(log_dir: &Path, default_level: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("daemon.log"))
        .context("failed to open daemon.log")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(Mutex::new(log_file));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}

/// Best-effort variant for tests and tools that may race on the global
/// subscriber.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_print_in_wire_form() {
        assert_eq!(Domain::Admin.to_string(), "admin");
        assert_eq!(Domain::Completion.to_string(), "completion");
    }
}
