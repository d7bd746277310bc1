//! Error types for canoe-link.

use std::time::Duration;

use thiserror::Error;

use crate::capture::CaptureError;

/// Failures reported by a [`RemoteApplication`](crate::remote::RemoteApplication) backend.
///
/// These never leave the crate's session API as-is: every call site classifies
/// them into a [`LinkError`].
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("application unavailable: {0}")]
    Unavailable(String),

    /// The application itself raised an exception.
    #[error("{0}")]
    Remote(String),

    #[error("bridge transport failed: {0}")]
    Transport(String),

    #[error("no response from bridge within {0:?}")]
    Timeout(Duration),

    #[error("unexpected response from bridge")]
    UnexpectedResponse,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to spawn bridge process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("launcher '{0}' not found; install WINE or set bridge.launcher")]
    LauncherNotFound(String),

    #[error("bridge executable not found at: {0}")]
    BridgeExeNotFound(String),
}

impl RemoteError {
    /// True when the link itself is broken, as opposed to the application
    /// rejecting one request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RemoteError::Transport(_)
                | RemoteError::Timeout(_)
                | RemoteError::UnexpectedResponse
                | RemoteError::Json(_)
        )
    }

    /// A transport failure the link does not recover from. A timeout is not
    /// one: the application may only be busy.
    pub fn is_link_lost(&self) -> bool {
        self.is_transport() && !matches!(self, RemoteError::Timeout(_))
    }
}

/// Errors surfaced by a [`Session`](crate::Session) and the capture log.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot reach CANoe ({0}); check that it is installed and registered for automation")]
    Connect(#[source] RemoteError),

    #[error("not connected to CANoe; call connect() first")]
    NotConnected,

    #[error(
        "variable '{name}' not found in namespaces [{}]; list all variables or create it",
        .tried.join(", ")
    )]
    VariableNotFound { name: String, tried: Vec<String> },

    #[error("cannot read '{variable}': {reason}")]
    ReadFailure { variable: String, reason: String },

    #[error("cannot write '{variable}': {reason}")]
    WriteFailure { variable: String, reason: String },

    #[error("cannot create '{namespace}::{name}': {reason}")]
    CreateFailure {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("CAPL function '{0}' not found; check that it is defined and the configuration is compiled")]
    ProcedureNotFound(String),

    #[error("CAPL function '{procedure}' failed: {message}")]
    InvocationFailure { procedure: String, message: String },

    #[error("{operation} timed out after {after:?}; CANoe may be busy or hung")]
    Timeout { operation: String, after: Duration },

    #[error("measurement control failed: {0}")]
    Measurement(String),

    #[error("cannot enumerate namespaces: {0}")]
    EnumerationFailed(String),

    #[error("capture log error: {0}")]
    Capture(#[from] CaptureError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LinkError {
    /// Lookup and connection failures: the caller may react (retry, create,
    /// enumerate) and keep using the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::Connect(_)
                | LinkError::NotConnected
                | LinkError::VariableNotFound { .. }
                | LinkError::ProcedureNotFound(_)
                | LinkError::Timeout { .. }
        )
    }

    /// Classify a backend failure: timeouts keep their own kind, anything else
    /// becomes the operation-specific error built by `otherwise`.
    pub(crate) fn from_remote(
        err: RemoteError,
        operation: &str,
        otherwise: impl FnOnce(String) -> LinkError,
    ) -> LinkError {
        match err {
            RemoteError::Timeout(after) => LinkError::Timeout {
                operation: operation.to_string(),
                after,
            },
            other => otherwise(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_distinct() {
        let errors = [
            LinkError::Connect(RemoteError::Unavailable("x".into())),
            LinkError::NotConnected,
            LinkError::VariableNotFound {
                name: "x".into(),
                tried: vec!["A".into()],
            },
            LinkError::ReadFailure {
                variable: "x".into(),
                reason: "x".into(),
            },
            LinkError::WriteFailure {
                variable: "x".into(),
                reason: "x".into(),
            },
            LinkError::ProcedureNotFound("x".into()),
            LinkError::InvocationFailure {
                procedure: "x".into(),
                message: "x".into(),
            },
        ];
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_not_found_lists_candidates() {
        let err = LinkError::VariableNotFound {
            name: "Temperature".into(),
            tried: vec!["General".into(), "Measurement".into()],
        };
        assert_eq!(
            err.to_string(),
            "variable 'Temperature' not found in namespaces [General, Measurement]; \
             list all variables or create it"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_timeout_keeps_its_kind() {
        let err = LinkError::from_remote(
            RemoteError::Timeout(Duration::from_secs(2)),
            "read",
            |reason| LinkError::ReadFailure {
                variable: "v".into(),
                reason,
            },
        );
        assert!(matches!(err, LinkError::Timeout { ref operation, .. } if operation == "read"));

        let err = LinkError::from_remote(RemoteError::Remote("denied".into()), "read", |reason| {
            LinkError::ReadFailure {
                variable: "v".into(),
                reason,
            }
        });
        assert!(matches!(err, LinkError::ReadFailure { ref reason, .. } if reason == "denied"));
    }

    #[test]
    fn test_timeout_does_not_lose_the_link() {
        assert!(RemoteError::Transport("broken pipe".into()).is_link_lost());
        assert!(RemoteError::UnexpectedResponse.is_link_lost());
        assert!(!RemoteError::Timeout(Duration::from_secs(1)).is_link_lost());
        assert!(!RemoteError::Remote("type mismatch".into()).is_link_lost());
    }
}
