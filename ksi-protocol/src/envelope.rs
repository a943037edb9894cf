//! Command envelope and response shapes.
//!
//! Every request is `{"command", "version", "parameters", "metadata"}` and
//! every reply is a tagged union on `status`. Event frames pushed on
//! persistent connections are plain objects with a `type` field and no
//! `status`, which is how clients tell them apart from replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;
use crate::timestamp_utc;

/// An incoming command frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandEnvelope {
    /// Wire name of the command, e.g. `HEALTH_CHECK`.
    pub command: String,

    /// Protocol version; absent is treated as current.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Command parameters, validated per command.
    #[serde(default)]
    pub parameters: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>, parameters: Value) -> Self {
        Self {
            command: command.into(),
            version: Some(crate::PROTOCOL_VERSION.to_string()),
            parameters,
            metadata: Some(EnvelopeMetadata::fresh()),
        }
    }

    /// The request id, minting one when the client did not supply it.
    pub fn request_id(&self) -> String {
        self.metadata
            .as_ref()
            .and_then(|m| m.request_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Client-supplied request metadata. Keys beyond these three are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl EnvelopeMetadata {
    pub fn fresh() -> Self {
        Self {
            timestamp: Some(timestamp_utc()),
            request_id: Some(uuid::Uuid::new_v4().to_string()),
            client_id: None,
        }
    }
}

/// A reply to a single command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Success {
        command: String,
        result: Value,
        metadata: ResponseMetadata,
    },
    Error {
        command: String,
        error: ErrorDetail,
        metadata: ResponseMetadata,
    },
}

impl Response {
    pub fn success(command: impl Into<String>, result: Value) -> Self {
        Response::Success {
            command: command.into(),
            result,
            metadata: ResponseMetadata::now(),
        }
    }

    pub fn error(command: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            command: command.into(),
            error: ErrorDetail {
                code,
                message: message.into(),
                timestamp: timestamp_utc(),
            },
            metadata: ResponseMetadata::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }

    pub fn command(&self) -> &str {
        match self {
            Response::Success { command, .. } | Response::Error { command, .. } => command,
        }
    }

    /// The success payload, or `None` for error replies.
    pub fn result(&self) -> Option<&Value> {
        match self {
            Response::Success { result, .. } => Some(result),
            Response::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ResponseMetadata {
    pub fn now() -> Self {
        Self {
            timestamp: timestamp_utc(),
            request_id: None,
        }
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp_utc(),
            request_id: Some(request_id.into()),
        }
    }
}
