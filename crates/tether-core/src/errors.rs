//! Unified error type for the Tether engine
//!
//! Errors fall into two camps. Local inconsistencies (a result that does not
//! match its query, a view accessed as the wrong kind, a list index past the
//! end) are programming errors and surface immediately. Network-origin
//! failures are reified as host state by the client and never escape the
//! query host boundary.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unified error type for all Tether operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TetherError {
    /// Result shape, envelope routing or host tree disagree with the query
    #[error("Protocol mismatch: {message}")]
    ProtocolMismatch {
        /// What did not line up
        message: String,
    },

    /// A view host was used as a kind it is not
    #[error("View '{view}' is a {found} view, expected {expected}")]
    ViewKindMismatch {
        /// View name
        view: String,
        /// Kind the caller asked for
        expected: String,
        /// Kind the view actually has
        found: String,
    },

    /// List access past the end of the cached items
    #[error("Index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Current list length
        len: usize,
    },

    /// Transport or server side failure
    #[error("Transport error: {message}")]
    Transport {
        /// Error message from the transport
        message: String,
    },

    /// A round trip did not finish in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Configured timeout
        after: Duration,
    },

    /// Wire encoding or decoding failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// A change id string could not be parsed
    #[error("Invalid change id '{input}'")]
    InvalidChangeId {
        /// Offending input
        input: String,
    },

    /// Invalid client configuration
    #[error("Invalid configuration: {message}")]
    Config {
        /// Error message describing the invalid setting
        message: String,
    },

    /// Operation on a host that has been stopped
    #[error("Host stopped")]
    Stopped,
}

impl TetherError {
    /// Create a protocol mismatch error
    pub fn protocol_mismatch(message: impl Into<String>) -> Self {
        Self::ProtocolMismatch {
            message: message.into(),
        }
    }

    /// Create a view kind mismatch error
    pub fn view_kind_mismatch(
        view: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::ViewKindMismatch {
            view: view.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an index out of bounds error
    pub fn index_out_of_bounds(index: usize, len: usize) -> Self {
        Self::IndexOutOfBounds { index, len }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for failures that originate on the network side
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

/// Standard Result type for Tether operations
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TetherError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}
