//! Wire protocol for the ksi daemon.
//!
//! Everything a client and the daemon must agree on lives here: the
//! newline-delimited JSON frame codec, the command envelope, one strict
//! parameter struct per command, the tagged success/error response shape,
//! and the error-code taxonomy. The daemon itself links this crate twice
//! over — once as a server, and once as a client during hot reload and the
//! startup collision guard.

pub mod client;
pub mod commands;
pub mod envelope;
pub mod error;
pub mod frame;

pub use client::DaemonClient;
pub use commands::CommandName;
pub use envelope::{CommandEnvelope, EnvelopeMetadata, ErrorDetail, Response, ResponseMetadata};
pub use error::ErrorCode;
pub use frame::{FrameError, FrameReader, FrameWriter, MAX_FRAME_BYTES};

/// Protocol version carried in every command envelope.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Format a timestamp the way every wire message expects it: RFC-3339 UTC
/// with a `Z` suffix and no sub-second noise beyond milliseconds.
pub fn timestamp_utc() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
