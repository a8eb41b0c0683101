//! Error taxonomy for the command channel.

use thiserror::Error;

/// Fragments that mark an error message as connection-related.
///
/// Matched case-insensitively against the rendered error. Anything matching
/// is eligible for reconnect-and-retry by higher-level policies.
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection closed",
    "connection lost",
    "connection reset",
    "connection aborted",
    "econnreset",
    "econnaborted",
    "epipe",
    "broken pipe",
    "timed out",
    "timeout",
    "socket",
    "not connected",
];

/// Channel-level error types.
///
/// Every variant renders with a stable prefix so callers can pattern-match
/// on the message text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    /// The transport could not be established.
    #[error("Connection failed to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// An established connection dropped while requests were outstanding.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The connection was closed on purpose by `disconnect()`.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A request was issued without a live connection.
    #[error("Not connected to editor")]
    NotConnected,

    /// No reply arrived before the per-call deadline.
    #[error("Command timed out: {command} after {after_ms}ms")]
    Timeout { command: String, after_ms: u64 },

    /// The editor replied with an error. Never retried.
    #[error("Command error: {message}")]
    Command {
        message: String,
        code: Option<String>,
    },

    /// The request could not be encoded or the reply made no sense.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The editor package does not match this bridge.
    #[error("Version mismatch: bridge v{bridge} != editor v{editor}")]
    VersionMismatch { bridge: String, editor: String },
}

impl ChannelError {
    /// Whether this failure is mechanical and may succeed after reconnecting.
    ///
    /// Editor-reported failures and version mismatches are never transient,
    /// and neither is a failed initial connect. Everything else is classified
    /// by its message text.
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Command { .. }
            | ChannelError::VersionMismatch { .. }
            | ChannelError::Connect { .. } => false,
            other => is_transient_message(&other.to_string()),
        }
    }

    /// Whether this is a per-call deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout { .. })
    }
}

/// Classify free-form error text against the transient pattern set.
pub fn is_transient_message(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    TRANSIENT_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// Render a connect failure the way operators need to read it.
pub(crate) fn describe_connect_error(err: &std::io::Error) -> String {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => format!(
            "connection refused ({}). Start the Unity Editor and make sure the bridge package is listening",
            err
        ),
        _ => err.to_string(),
    }
}
