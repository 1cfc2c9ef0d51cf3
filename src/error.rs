//! # Error Types
//!
//! Custom error types for Slate Gateway using `thiserror`.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Slate Gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed datagram, response line or schema frame
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// JSON that parsed but does not have the shape of a schema tree
    #[error("Schema error: {0}")]
    Schema(String),

    /// The reliable channel was closed or reset by the peer
    #[error("Transport reset during {operation}: {source}")]
    TransportReset {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A reliable-channel operation did not finish in time
    #[error("Transport timeout during {operation} after {after:?}")]
    TransportTimeout {
        operation: &'static str,
        after: Duration,
    },

    /// A path that does not exist in the current schema
    #[error("Unknown path: {0}")]
    UnknownPath(String),

    /// Command or request made without a valid token
    #[error("Unauthorized")]
    Unauthorized,

    /// Operator command that cannot be turned into a wire frame
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Wrap an I/O failure on the reliable channel.
    pub fn reset(operation: &'static str, source: std::io::Error) -> Self {
        GatewayError::TransportReset { operation, source }
    }

    /// True for the two failure kinds that force the uplink to reconnect.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::TransportReset { .. } | GatewayError::TransportTimeout { .. }
        )
    }
}

/// Result type alias for Slate Gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
