//! Newline-delimited JSON frame codec.
//!
//! Each direction of a connection carries UTF-8 JSON objects separated by a
//! single `\n`. A malformed frame never desynchronises the stream: the codec
//! always consumes up to the next `\n`, so the peer can keep talking after a
//! bad frame.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum size of a single frame, excluding the terminating newline.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The connection closed cleanly between frames.
    #[error("connection closed")]
    Closed,

    /// Bytes arrived but the stream ended before the terminating newline.
    #[error("truncated frame at end of stream ({0} bytes without newline)")]
    Truncated(usize),

    /// The frame exceeded the configured maximum.
    #[error("frame exceeds maximum size of {max} bytes")]
    TooLarge { max: usize },

    /// The frame terminated properly but was not valid JSON.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the stream is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::InvalidJson(_))
    }
}

/// Buffered reader half of a framed connection.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_frame: usize,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame(reader, MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(reader: R, max_frame: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame,
            line: String::new(),
        }
    }

    /// Read the next raw frame, without parsing it.
    ///
    /// Returns `FrameError::Closed` on a clean EOF and `Truncated` when the
    /// peer died mid-frame.
    pub async fn read_raw(&mut self) -> Result<&str, FrameError> {
        self.line.clear();
        let n = (&mut self.inner)
            .take(self.max_frame as u64 + 1)
            .read_line(&mut self.line)
            .await?;
        if n == 0 {
            return Err(FrameError::Closed);
        }
        if !self.line.ends_with('\n') {
            if n > self.max_frame {
                // Drain the rest of the oversized frame so the stream stays
                // aligned on the next newline.
                self.discard_to_newline().await?;
                return Err(FrameError::TooLarge {
                    max: self.max_frame,
                });
            }
            return Err(FrameError::Truncated(n));
        }
        Ok(self.line.trim_end_matches(['\n', '\r']))
    }

    /// Read and parse the next frame as `T`.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        let raw = self.read_raw().await?;
        Ok(serde_json::from_str(raw)?)
    }

    async fn discard_to_newline(&mut self) -> Result<(), FrameError> {
        let mut sink = Vec::new();
        loop {
            sink.clear();
            let n = (&mut self.inner)
                .take(8192)
                .read_until(b'\n', &mut sink)
                .await?;
            if n == 0 || sink.ends_with(b"\n") {
                return Ok(());
            }
        }
    }
}

/// Writer half of a framed connection.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    /// Serialise `value` and write it as one frame.
    pub async fn write_frame<T: Serialize>(&mut self, value: &T) -> Result<(), FrameError> {
        let mut buf = serde_json::to_vec(value)?;
        if buf.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                max: MAX_FRAME_BYTES,
            });
        }
        buf.push(b'\n');
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_frame(&json!({"command": "HEALTH_CHECK"}))
            .await
            .unwrap();

        let frame: Value = reader.read_frame().await.unwrap();
        assert_eq!(frame["command"], "HEALTH_CHECK");
    }

    #[tokio::test]
    async fn malformed_frame_does_not_desync_the_stream() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server);

        tokio::io::AsyncWriteExt::write_all(&mut client, b"{not json}\n{\"ok\":true}\n")
            .await
            .unwrap();

        let err = reader.read_frame::<Value>().await.unwrap_err();
        assert!(err.is_recoverable(), "bad JSON should be recoverable: {err}");

        let next: Value = reader.read_frame().await.unwrap();
        assert_eq!(next["ok"], true);
    }

    #[tokio::test]
    async fn clean_eof_reports_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_frame::<Value>().await.unwrap_err(),
            FrameError::Closed
        ));
    }

    #[tokio::test]
    async fn partial_frame_at_eof_is_a_protocol_error() {
        let (mut client, server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"{\"half\":")
            .await
            .unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_frame::<Value>().await.unwrap_err(),
            FrameError::Truncated(_)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_and_skipped() {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let mut reader = FrameReader::with_max_frame(server, 128);

        let big = format!("{{\"pad\":\"{}\"}}\n", "x".repeat(512));
        tokio::io::AsyncWriteExt::write_all(&mut client, big.as_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"{\"ok\":1}\n")
            .await
            .unwrap();

        assert!(matches!(
            reader.read_frame::<Value>().await.unwrap_err(),
            FrameError::TooLarge { .. }
        ));
        let next: Value = reader.read_frame().await.unwrap();
        assert_eq!(next["ok"], 1);
    }
}
