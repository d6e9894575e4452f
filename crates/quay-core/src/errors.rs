use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::ClientId;

/// Stable status codes surfaced to RPC clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Ok,
    InvalidArgument,
    Forbidden,
    NotFound,
    DeadlineExceeded,
    ResourceExhausted,
    Unavailable,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy shared by every proxy component.
///
/// Cloneable so the same failure can be handed to the post-send hook and
/// returned to the caller.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    /// Declared role, topics or subscriptions are missing or malformed.
    #[error("invalid client settings: {0}")]
    InvalidClientSettings(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The write-queue selector declined to route the message.
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Write attempted on a torn-down channel.
    #[error("channel closed for client {0}")]
    ChannelClosed(ClientId),
    #[error("stream send queue full for client {0}")]
    Busy(ClientId),
    /// Watchdog fired before the call completed.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    /// Failure reported by the legacy dispatch path, surfaced as-is.
    #[error("upstream failure ({code}): {message}")]
    UpstreamFailure { code: i32, message: String },
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn upstream(code: i32, message: impl Into<String>) -> Self {
        Self::UpstreamFailure {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Code {
        match self {
            Self::InvalidClientSettings(_) | Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::Forbidden(_) => Code::Forbidden,
            Self::NotFound(_) => Code::NotFound,
            Self::ChannelClosed(_) => Code::Unavailable,
            Self::Busy(_) => Code::ResourceExhausted,
            Self::Timeout(_) => Code::DeadlineExceeded,
            Self::UpstreamFailure { .. } | Self::Internal(_) => Code::Internal,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidClientSettings(_) => "invalid_client_settings",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::ChannelClosed(_) => "channel_closed",
            Self::Busy(_) => "busy",
            Self::Timeout(_) => "timeout",
            Self::UpstreamFailure { .. } => "upstream_failure",
            Self::Internal(_) => "internal",
        }
    }
}
