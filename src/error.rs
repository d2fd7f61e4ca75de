//! Error types for MQTT session operations
//!
//! Synchronous failures are returned to the caller as [`SessionError`].
//! Transport-level failures never surface here; they become `error` events
//! and state transitions instead.

use crate::config::ConfigError;
use crate::session::connection::{ConnectionState, ErrorCause};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Error taxonomy bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network, TLS, authentication or handshake protocol failure
    Connection,
    /// Malformed packet or unexpected acknowledgement
    Protocol,
    /// Operation invalid for the current connection state
    State,
    /// Packet identifiers or queue capacity used up
    ResourceExhaustion,
    /// Bad configuration, caught before a session exists
    Configuration,
}

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection failed ({cause:?}): {message}")]
    Connection { cause: ErrorCause, message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Resource exhausted: {message}")]
    ResourceExhaustion { message: String },

    #[error("Offline publish queue is full ({limit} messages)")]
    QueueFull { limit: usize },

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Timed out after {waited:?} - current state: {state:?}")]
    Timeout {
        waited: std::time::Duration,
        state: ConnectionState,
    },

    #[error("Session has been shut down")]
    SessionClosed,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection { .. } => ErrorKind::Connection,
            SessionError::Protocol { .. } => ErrorKind::Protocol,
            SessionError::InvalidState { .. }
            | SessionError::NotConnected { .. }
            | SessionError::InvalidTopic { .. }
            | SessionError::Timeout { .. }
            | SessionError::SessionClosed => ErrorKind::State,
            SessionError::ResourceExhaustion { .. } | SessionError::QueueFull { .. } => {
                ErrorKind::ResourceExhaustion
            }
            SessionError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Create connection error
    pub fn connection<S: Into<String>>(cause: ErrorCause, message: S) -> Self {
        Self::Connection {
            cause,
            message: message.into(),
        }
    }

    /// Create protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create resource exhaustion error
    pub fn resource_exhaustion<S: Into<String>>(message: S) -> Self {
        Self::ResourceExhaustion {
            message: message.into(),
        }
    }

    /// Create invalid topic error
    pub fn invalid_topic<T: Into<String>, R: ToString>(topic: T, reason: R) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("valid regex")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config|private)/[a-zA-Z0-9._/-]+")
        .expect("valid regex")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Sanitize error messages before they leave the session in `error` events
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SessionError::connection(ErrorCause::TlsHandshakeFailed, "bad cert").kind(),
            ErrorKind::Connection
        );
        assert_eq!(SessionError::protocol("bad ack").kind(), ErrorKind::Protocol);
        assert_eq!(
            SessionError::NotConnected {
                state: ConnectionState::Disconnected
            }
            .kind(),
            ErrorKind::State
        );
        assert_eq!(
            SessionError::QueueFull { limit: 10 }.kind(),
            ErrorKind::ResourceExhaustion
        );
        assert_eq!(
            SessionError::resource_exhaustion("ids").kind(),
            ErrorKind::ResourceExhaustion
        );
        assert_eq!(
            SessionError::Config(ConfigError::Validation("port".into())).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_error_display() {
        let error = SessionError::InvalidState {
            operation: "connect",
            state: ConnectionState::Connected,
        };
        assert_eq!(error.to_string(), "Cannot connect while connected");

        let error = SessionError::NotConnected {
            state: ConnectionState::Reconnecting,
        };
        assert_eq!(
            error.to_string(),
            "Not connected - current state: Reconnecting"
        );

        let error = SessionError::invalid_topic("a/#/b", "'#' must be last");
        assert_eq!(error.to_string(), "Invalid topic 'a/#/b': '#' must be last");
    }

    #[test]
    fn test_error_message_sanitization() {
        let sanitized =
            sanitize_error_message("Failed to authenticate: password=secret123 token=abc456");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_sanitize_case_insensitive_and_colons() {
        let sanitized = sanitize_error_message("PASSWORD: secret123 Token=abc");
        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc"));
    }

    #[test]
    fn test_file_path_redaction() {
        let sanitized = sanitize_error_message("Failed to read /home/user/.ssh/id_rsa");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));

        // Multi-byte characters are never split
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let message = "x".repeat(500);
        assert_eq!(sanitize_error_message(&message), message);
    }
}
