// src/exchange/outcome.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::errors::{Result, RpcError};
use super::transport::{ChannelHandle, Response, Status};

/// Result envelope produced by the invocation layer and carried in the
/// payload of an OK response. A remote exception travels inside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub exception: Option<String>,
}

impl RpcResult {
    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            exception: None,
        }
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            value: None,
            exception: Some(message.into()),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Re-raises a carried exception, otherwise hands back the value.
    pub fn recreate(self) -> std::result::Result<Option<Value>, String> {
        match self.exception {
            Some(exception) => Err(exception),
            None => Ok(self.value),
        }
    }
}

/// Terminal state of a pending call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Option<Value>),
    Error(String),
    ClientTimeout(String),
    ServerTimeout(String),
    Cancelled(String),
    ChannelInactive(String),
}

impl Outcome {
    /// Translates a transport response, unwrapping the result envelope.
    ///
    /// A payload that fails to decode becomes an `Error` outcome rather than
    /// being dropped.
    pub fn from_response(response: Response) -> Self {
        let message = response
            .error_message
            .unwrap_or_else(|| format!("response status {}", response.status.code()));

        match response.status {
            Status::Ok => match response.result {
                None => Outcome::Success(None),
                Some(bytes) if bytes.is_empty() => Outcome::Success(None),
                Some(bytes) => match serde_json::from_slice::<RpcResult>(&bytes) {
                    Ok(result) => match result.recreate() {
                        Ok(value) => Outcome::Success(value),
                        Err(exception) => Outcome::Error(exception),
                    },
                    Err(e) => {
                        warn!(call_id = response.id, error = %e, "Failed to decode result payload");
                        Outcome::Error(format!("Failed to decode result payload: {}", e))
                    }
                },
            },
            Status::ClientTimeout => Outcome::ClientTimeout(message),
            Status::ServerTimeout => Outcome::ServerTimeout(message),
            Status::ChannelInactive => Outcome::ChannelInactive(message),
            _ => Outcome::Error(message),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Maps the outcome onto what a caller sees, tagging errors with the channel.
    pub fn to_result(&self, channel: &ChannelHandle) -> Result<Option<Value>> {
        let channel = channel.to_string();
        match self {
            Outcome::Success(value) => Ok(value.clone()),
            Outcome::Error(message) => Err(RpcError::ServiceError {
                channel,
                message: message.clone(),
            }),
            Outcome::ClientTimeout(message) => Err(RpcError::ClientTimeout {
                channel,
                message: message.clone(),
            }),
            Outcome::ServerTimeout(message) => Err(RpcError::ServerTimeout {
                channel,
                message: message.clone(),
            }),
            Outcome::Cancelled(message) => Err(RpcError::Cancelled {
                channel,
                message: message.clone(),
            }),
            Outcome::ChannelInactive(message) => Err(RpcError::ChannelInactive {
                channel,
                message: message.clone(),
            }),
        }
    }
}
