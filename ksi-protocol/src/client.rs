//! Minimal async client for the daemon socket.
//!
//! One request per call; the caller owns retry policy. Used by the hot
//! reload controller, the startup collision guard, agent workers and tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::envelope::{CommandEnvelope, Response};
use crate::frame::{FrameError, FrameReader, FrameWriter};

/// Default per-operation socket timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A connected client holding one framed Unix-socket stream.
pub struct DaemonClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    timeout: Duration,
}

impl DaemonClient {
    /// Connect to the daemon socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        Self::connect_with_timeout(path, DEFAULT_SOCKET_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            timeout,
        })
    }

    /// Send one command and wait for its reply.
    ///
    /// Event frames pushed by the daemon (objects with `type` and no
    /// `status`) are skipped; the next `status`-bearing frame is the reply.
    pub async fn request(
        &mut self,
        command: &str,
        parameters: Value,
    ) -> Result<Response, ClientError> {
        let envelope = CommandEnvelope::new(command, parameters);
        self.writer.write_frame(&envelope).await?;
        loop {
            let frame: Value = tokio::time::timeout(self.timeout, self.reader.read_frame())
                .await
                .map_err(|_| ClientError::Timeout(self.timeout))??;
            if frame.get("status").is_some() {
                return Ok(serde_json::from_value(frame).map_err(FrameError::InvalidJson)?);
            }
            tracing::debug!(frame = %frame, "skipping pushed event frame while awaiting reply");
        }
    }

    /// Send an arbitrary pre-built frame and wait for the reply. For tests
    /// and tools that need to step outside the envelope helper.
    pub async fn request_raw(&mut self, frame: Value) -> Result<Response, ClientError> {
        self.writer.write_frame(&frame).await?;
        loop {
            let frame: Value = tokio::time::timeout(self.timeout, self.reader.read_frame())
                .await
                .map_err(|_| ClientError::Timeout(self.timeout))??;
            if frame.get("status").is_some() {
                return Ok(serde_json::from_value(frame).map_err(FrameError::InvalidJson)?);
            }
        }
    }

    /// Read the next pushed event frame (persistent-channel mode).
    pub async fn next_event(&mut self, timeout: Duration) -> Result<Value, ClientError> {
        let frame: Value = tokio::time::timeout(timeout, self.reader.read_frame())
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;
        Ok(frame)
    }

    /// Probe the daemon: true only on a definitive `status=healthy` reply.
    pub async fn health_check(path: impl AsRef<Path>, timeout: Duration) -> bool {
        let Ok(mut client) = Self::connect_with_timeout(&path, timeout).await else {
            return false;
        };
        match client.request("HEALTH_CHECK", Value::Object(Default::default())).await {
            Ok(response) => response
                .result()
                .and_then(|r| r.get("status"))
                .and_then(Value::as_str)
                == Some("healthy"),
            Err(_) => false,
        }
    }

    /// Close the write half, letting the server observe EOF.
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
