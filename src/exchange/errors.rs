// src/exchange/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;

/// Failure classification handed to callers of a pending call.
///
/// Every runtime variant carries the channel description (`local -> remote`)
/// and the diagnostic message built when the call was resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("Client-side timeout on channel {channel}: {message}")]
    ClientTimeout { channel: String, message: String },

    #[error("Server-side timeout on channel {channel}: {message}")]
    ServerTimeout { channel: String, message: String },

    #[error("Service error on channel {channel}: {message}")]
    ServiceError { channel: String, message: String },

    #[error("Transport error on channel {channel}: {message}")]
    TransportError { channel: String, message: String },

    #[error("Request cancelled on channel {channel}: {message}")]
    Cancelled { channel: String, message: String },

    #[error("Channel {channel} became inactive: {message}")]
    ChannelInactive { channel: String, message: String },

    #[error("Invalid use: {0}")]
    InvalidUse(String),

    #[error("Result deserialization error: {0}")]
    DeserializationError(String),

    #[error("Timeout scheduler error: {0}")]
    SchedulerError(String),
}

impl RpcError {
    /// True for both client-side and server-side timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::ClientTimeout { .. } | RpcError::ServerTimeout { .. }
        )
    }

    /// True when the request had been written before the deadline fired.
    pub fn is_server_side(&self) -> bool {
        matches!(self, RpcError::ServerTimeout { .. })
    }
}

// Custom Result type for exchange operations
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<SerdeError> for RpcError {
    fn from(error: SerdeError) -> Self {
        RpcError::DeserializationError(error.to_string())
    }
}
