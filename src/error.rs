//! Error types for a3s-session

use crate::types::SessionStatus;
use thiserror::Error;

/// Errors that can occur while driving a remote session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Network failure before a response was received
    #[error("Connection error: {0}")]
    Connection(String),

    /// Non-success HTTP response
    #[error("HTTP {status} from '{endpoint}': {message}")]
    Http {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Lease superseded, expired, or otherwise no longer held (HTTP 409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Event stream failure
    #[error("Stream error: {0}")]
    Stream(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event with a tag this client does not understand
    #[error("Unknown event tag: {0}")]
    UnknownEvent(String),

    /// Session or resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Status change not permitted from the current status
    #[error("Cannot {action} while session is {from}")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },

    /// No lease is held locally
    #[error("No active takeover lease: {0}")]
    NoLease(String),

    /// Duplex transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation abandoned because its owner was disposed
    #[error("Operation cancelled")]
    Cancelled,
}

/// How a failure should be handled by the component that observed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blip or server-side failure; retry per component policy
    Transient,
    /// Lease superseded or stale session; stop and refresh state
    Conflict,
    /// Request rejected by the server; surface, never retry
    Client,
    /// Protocol violation or local misuse
    Fatal,
}

impl SessionError {
    /// Classify this error for retry-vs-abort decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Connection(_)
            | SessionError::Timeout(_)
            | SessionError::Stream(_)
            | SessionError::Transport(_) => ErrorClass::Transient,
            SessionError::Http { status, .. } => match *status {
                409 => ErrorClass::Conflict,
                408 | 429 => ErrorClass::Transient,
                400..=499 => ErrorClass::Client,
                _ => ErrorClass::Transient,
            },
            SessionError::Conflict(_) => ErrorClass::Conflict,
            SessionError::NotFound(_) => ErrorClass::Client,
            SessionError::NoLease(_) => ErrorClass::Conflict,
            SessionError::Serialization(_)
            | SessionError::UnknownEvent(_)
            | SessionError::Config(_)
            | SessionError::InvalidTransition { .. }
            | SessionError::Cancelled => ErrorClass::Fatal,
        }
    }

    /// Whether a caller may retry the failed operation
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Build an error from an HTTP status, promoting 409 to `Conflict`
    pub fn from_status(endpoint: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 409 {
            return SessionError::Conflict(message);
        }
        if status == 404 {
            return SessionError::NotFound(format!("{}: {}", endpoint.into(), message));
        }
        SessionError::Http {
            endpoint: endpoint.into(),
            status,
            message,
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SessionError::Timeout(err.to_string());
        }
        if let Some(status) = err.status() {
            let endpoint = err.url().map(|u| u.path().to_string()).unwrap_or_default();
            return SessionError::from_status(endpoint, status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return SessionError::Stream(format!("decode failed: {}", err));
        }
        SessionError::Connection(err.to_string())
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_status_is_promoted() {
        let err = SessionError::from_status("/takeover/renew", 409, "lease superseded");
        assert!(matches!(err, SessionError::Conflict(_)));
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = SessionError::from_status("/takeover", 403, "forbidden");
        assert_eq!(err.class(), ErrorClass::Client);
        assert!(!err.is_transient());

        let err = SessionError::from_status("/sessions/x", 404, "missing");
        assert!(matches!(err, SessionError::NotFound(_)));
        assert_eq!(err.class(), ErrorClass::Client);
    }

    #[test]
    fn test_server_and_network_errors_are_transient() {
        assert!(SessionError::from_status("/renew", 503, "unavailable").is_transient());
        assert!(SessionError::from_status("/renew", 429, "slow down").is_transient());
        assert!(SessionError::Connection("reset".into()).is_transient());
        assert!(SessionError::Timeout("30s".into()).is_transient());
    }

    #[test]
    fn test_protocol_errors_are_fatal() {
        assert_eq!(SessionError::UnknownEvent("ping".into()).class(), ErrorClass::Fatal);
        let err = SessionError::InvalidTransition {
            from: SessionStatus::Completed,
            action: "start takeover",
        };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(err.to_string(), "Cannot start takeover while session is completed");
    }
}
