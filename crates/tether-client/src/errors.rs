//! Command errors
//!
//! Failures of imperative round trips (`send`, `call`, `dispatch_event`) are
//! returned to the caller as values instead of moving any host into an error
//! state.

use std::time::Duration;
use tether_core::TetherError;

/// Outcome of a failed command or flow dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// No answer within the configured timeout
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Configured timeout
        after: Duration,
    },

    /// The transport failed to deliver the request or the answer
    #[error("Transport error: {message}")]
    Transport {
        /// Error message from the transport
        message: String,
    },

    /// The server answered with a refusal
    #[error("Rejected: {message}")]
    Rejected {
        /// Reason given by the server
        message: String,
    },
}

impl CommandError {
    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// True for timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<TetherError> for CommandError {
    fn from(err: TetherError) -> Self {
        match err {
            TetherError::Timeout { operation, after } => Self::Timeout { operation, after },
            TetherError::Transport { message } => Self::Transport { message },
            other => Self::Rejected {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_keep_their_category() {
        let err = CommandError::from(TetherError::transport("socket closed"));
        assert_eq!(
            err,
            CommandError::Transport {
                message: "socket closed".into()
            }
        );
        let err = CommandError::from(TetherError::timeout("call", Duration::from_secs(1)));
        assert!(err.is_timeout());
    }

    #[test]
    fn other_failures_are_rejections() {
        let err = CommandError::from(TetherError::protocol_mismatch("unknown command"));
        assert!(matches!(err, CommandError::Rejected { .. }));
        assert!(err.to_string().contains("unknown command"));
    }
}
