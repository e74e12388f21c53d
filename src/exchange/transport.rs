// src/exchange/transport.rs
// Narrow view of the transport layer: the exchange only needs channel
// identity, a parameter bag, and the request/response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// URL parameter key holding the per-channel default timeout in milliseconds.
pub const TIMEOUT_KEY: &str = "timeout";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// Non-owning identity of a connection.
///
/// Pending calls and registry entries keep this instead of the connection
/// itself, so a closed connection is never held alive by in-flight calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub id: Uuid,
    pub local_address: String,
    pub remote_address: String,
}

impl ChannelHandle {
    pub fn new(local_address: impl Into<String>, remote_address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_address: local_address.into(),
            remote_address: remote_address.into(),
        }
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChannelHandle {}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local_address, self.remote_address)
    }
}

/// Configuration bag attached to a channel, e.g. `rpc://10.0.0.2:20880?timeout=3000`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUrl {
    pub address: String,
    pub parameters: HashMap<String, String>,
}

impl ChannelUrl {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            parameters: HashMap::new(),
        }
    }

    /// Parses `address?key=value&key=value`. Pairs without `=` are kept with an empty value.
    pub fn parse(url: &str) -> Self {
        let (address, query) = match url.split_once('?') {
            Some((address, query)) => (address, query),
            None => (url, ""),
        };

        let parameters = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        Self {
            address: address.to_string(),
            parameters,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(key.into(), value.to_string());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Returns the parameter when it parses to a positive number, `default` otherwise.
    pub fn positive_parameter(&self, key: &str, default: u64) -> u64 {
        match self.parameter(key).and_then(|value| value.trim().parse::<i64>().ok()) {
            Some(value) if value > 0 => value as u64,
            _ => default,
        }
    }
}

/// A connection as seen by the exchange.
pub trait Channel: Send + Sync {
    fn handle(&self) -> ChannelHandle;

    fn url(&self) -> &ChannelUrl;
}

/// Outgoing request envelope. Only the id matters to the exchange; the rest
/// is carried for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub two_way: bool,
    pub data: Value,
}

impl Request {
    /// New two-way request with a process-wide unique id.
    pub fn new(data: Value) -> Self {
        Self::with_id(next_request_id(), data)
    }

    pub fn with_id(id: u64, data: Value) -> Self {
        Self {
            id,
            two_way: true,
            data,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request [id={}, twoway={}, data={}]",
            self.id, self.two_way, self.data
        )
    }
}

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Response status byte. The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 20,
    ClientTimeout = 30,
    ServerTimeout = 31,
    ChannelInactive = 35,
    BadRequest = 40,
    BadResponse = 50,
    ServiceNotFound = 60,
    ServiceError = 70,
    ServerError = 80,
    ClientError = 90,
    ServerThreadpoolExhaustedError = 100,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let status = match code {
            20 => Status::Ok,
            30 => Status::ClientTimeout,
            31 => Status::ServerTimeout,
            35 => Status::ChannelInactive,
            40 => Status::BadRequest,
            50 => Status::BadResponse,
            60 => Status::ServiceNotFound,
            70 => Status::ServiceError,
            80 => Status::ServerError,
            90 => Status::ClientError,
            100 => Status::ServerThreadpoolExhaustedError,
            _ => return None,
        };
        Some(status)
    }
}

/// Incoming response envelope, or a synthetic one built by the exchange itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u64,
    pub status: Status,
    pub result: Option<Vec<u8>>,
    pub error_message: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Vec<u8>) -> Self {
        Self {
            id,
            status: Status::Ok,
            result: Some(result),
            error_message: None,
        }
    }

    pub fn error(id: u64, status: Status, message: impl Into<String>) -> Self {
        Self {
            id,
            status,
            result: None,
            error_message: Some(message.into()),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response [id={}, status={}, error={}, result={}]",
            self.id,
            self.status.code(),
            self.error_message.as_deref().unwrap_or("null"),
            self.result
                .as_ref()
                .map(|bytes| format!("{} bytes", bytes.len()))
                .unwrap_or_else(|| "null".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(Status::Ok.code(), 20);
        assert_eq!(Status::ClientTimeout.code(), 30);
        assert_eq!(Status::ServerTimeout.code(), 31);
        assert_eq!(Status::ChannelInactive.code(), 35);
        assert_eq!(Status::ServiceError.code(), 70);
        assert_eq!(Status::ServerThreadpoolExhaustedError.code(), 100);

        for code in [20u8, 30, 31, 35, 40, 50, 60, 70, 80, 90, 100] {
            let status = Status::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(Status::from_code(21), None);
    }

    #[test]
    fn test_url_positive_parameter() {
        let url = ChannelUrl::parse("rpc://10.0.0.2:20880?timeout=3000&retries=0&bad=x");

        assert_eq!(url.address, "rpc://10.0.0.2:20880");
        assert_eq!(url.positive_parameter(TIMEOUT_KEY, 1000), 3000);
        assert_eq!(url.positive_parameter("retries", 2), 2);
        assert_eq!(url.positive_parameter("bad", 7), 7);
        assert_eq!(url.positive_parameter("missing", 9), 9);
    }

    #[test]
    fn test_url_with_negative_timeout_falls_back() {
        let url = ChannelUrl::new("rpc://host").with_parameter(TIMEOUT_KEY, -5);
        assert_eq!(url.positive_parameter(TIMEOUT_KEY, 1000), 1000);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let first = Request::new(json!("a"));
        let second = Request::new(json!("b"));
        assert_ne!(first.id, second.id);
        assert!(first.two_way);
    }

    #[test]
    fn test_channel_handle_equality_is_identity() {
        let a = ChannelHandle::new("127.0.0.1:5000", "127.0.0.1:20880");
        let b = ChannelHandle::new("127.0.0.1:5000", "127.0.0.1:20880");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.to_string(), "127.0.0.1:5000 -> 127.0.0.1:20880");
    }

    #[test]
    fn test_request_display() {
        let request = Request::with_id(42, json!({"method": "echo"}));
        assert_eq!(
            request.to_string(),
            r#"Request [id=42, twoway=true, data={"method":"echo"}]"#
        );
    }
}
